use crate::config::types::ConfinedError;
use crate::exec::function::{CallArgs, CallContext, Function};
use crate::exec::interpreter::reserve;
use crate::value::Value;

/// Functions every code block can call. Resolved before registered functions.
pub(crate) static BUILTINS: [Function; 8] = [
    Function::new("len", len),
    Function::new("str", to_str),
    Function::new("int", to_int),
    Function::new("float", to_float),
    Function::new("bool", to_bool),
    Function::new("type", type_of),
    Function::new("keys", keys),
    Function::new("range", range),
];

pub(crate) fn lookup(name: &str) -> Option<&'static Function> {
    BUILTINS.iter().find(|function| function.name() == name)
}

pub fn names() -> impl Iterator<Item = &'static str> {
    BUILTINS.iter().map(Function::name)
}

fn value_error(message: impl Into<String>) -> ConfinedError {
    ConfinedError::new("ValueError", message)
}

fn len(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    args.expect_len("len", 1)?;
    let arg = args.require(0)?;
    let length = arg.len().ok_or_else(|| {
        ConfinedError::type_error(format!("object of type '{}' has no len()", arg.type_name()))
    })?;
    Ok(Value::Int(length as i64))
}

fn to_str(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    args.expect_len("str", 1)?;
    Ok(Value::Str(args.require(0)?.to_string()))
}

fn to_int(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    args.expect_len("int", 1)?;
    let arg = args.require(0)?;
    match arg.to_value() {
        Value::Int(i) => Ok(Value::Int(i)),
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Float(f) => {
            if f.is_nan() {
                return Err(value_error("cannot convert float NaN to integer"));
            }
            let truncated = f.trunc();
            if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
                return Err(ConfinedError::new(
                    "OverflowError",
                    "float is out of integer range",
                ));
            }
            Ok(Value::Int(truncated as i64))
        }
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| value_error(format!("invalid literal for int(): {:?}", s))),
        other => Err(ConfinedError::type_error(format!(
            "int() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn to_float(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    args.expect_len("float", 1)?;
    let arg = args.require(0)?;
    if let Some(text) = arg.as_str() {
        return text
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| value_error(format!("could not convert string to float: {:?}", text)));
    }
    if let Some(b) = arg.as_bool() {
        return Ok(Value::Float(if b { 1.0 } else { 0.0 }));
    }
    arg.as_float().map(Value::Float).ok_or_else(|| {
        ConfinedError::type_error(format!(
            "float() argument must be a string or a number, not '{}'",
            arg.type_name()
        ))
    })
}

fn to_bool(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    args.expect_len("bool", 1)?;
    Ok(Value::Bool(args.require(0)?.is_truthy()))
}

fn type_of(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    args.expect_len("type", 1)?;
    Ok(Value::from(args.require(0)?.type_name()))
}

/// Visible keys of a map; names blocked by the active protections are omitted
fn keys(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    args.expect_len("keys", 1)?;
    let entries = args.require(0)?.entries()?;
    Ok(Value::List(entries.map(|(key, _)| Value::from(key)).collect()))
}

fn range(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    let (start, stop, step) = match args.len() {
        1 => (0, args.int(0)?, 1),
        2 => (args.int(0)?, args.int(1)?, 1),
        3 => (args.int(0)?, args.int(1)?, args.int(2)?),
        n => {
            return Err(ConfinedError::type_error(format!(
                "range() takes 1 to 3 positional arguments but {} were given",
                n
            )))
        }
    };
    if step == 0 {
        return Err(value_error("range() arg 3 must not be zero"));
    }

    // Element count in i128: the span of two i64 values does not fit in i64.
    let (span, stride) = if step > 0 {
        (i128::from(stop) - i128::from(start), i128::from(step))
    } else {
        (i128::from(start) - i128::from(stop), -i128::from(step))
    };
    let count = if span > 0 { (span + stride - 1) / stride } else { 0 };
    let count = usize::try_from(count)
        .map_err(|_| ConfinedError::memory_error("range() result is too long"))?;

    let mut items = Vec::new();
    reserve(&mut items, count)?;
    items.extend((0..count).map(|i| Value::Int((i128::from(start) + i as i128 * i128::from(step)) as i64)));
    Ok(Value::List(items))
}
