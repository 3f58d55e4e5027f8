use crate::capability::proxy::resolve_index;
use crate::capability::{Proxy, SealedNamespace};
use crate::config::types::ConfinedError;
use crate::exec::builtins;
use crate::exec::function::{CallArgs, CallContext, FunctionRegistry};
use crate::exec::script::{Accessor, BinaryOp, Code, Expr, Stmt, Target, UnaryOp};
use crate::value::{Namespace, Value};
use std::cmp::Ordering;

/// Name under which the callable names of a run are visible to the code
pub const BUILTINS_NAME: &str = "__builtins__";

/// Globals and locals of one run, both sealed in place.
///
/// Without a separate locals namespace the globals serve as both.
pub(crate) struct Frame<'n> {
    globals: SealedNamespace<'n>,
    locals: Option<SealedNamespace<'n>>,
}

impl<'n> Frame<'n> {
    pub(crate) fn new(globals: &'n mut Namespace, locals: Option<&'n mut Namespace>) -> Self {
        Self {
            globals: SealedNamespace::seal_in_place(globals),
            locals: locals.map(SealedNamespace::seal_in_place),
        }
    }

    pub(crate) fn inject(&mut self, name: &str, value: Value) {
        self.globals.inject(name, value);
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.locals
            .as_ref()
            .and_then(|locals| locals.lookup(name))
            .or_else(|| self.globals.lookup(name))
    }

    fn scope_mut(&mut self) -> &mut SealedNamespace<'n> {
        match self.locals.as_mut() {
            Some(locals) => locals,
            None => &mut self.globals,
        }
    }

    fn bind(&mut self, name: &str, value: Value) {
        self.scope_mut().bind(name, value);
    }

    fn unbind(&mut self, name: &str) -> Option<Value> {
        self.scope_mut().unbind(name)
    }

    fn target_mut(&mut self, name: &str) -> Result<Option<&mut Value>, ConfinedError> {
        match self.locals.as_mut() {
            Some(locals) if locals.contains(name) => locals.target_mut(name),
            _ => self.globals.target_mut(name),
        }
    }
}

/// Result of evaluating an expression: a borrow of a namespace value or a
/// value created during evaluation
enum Operand<'e> {
    Ref(&'e Value),
    Owned(Value),
}

impl Operand<'_> {
    fn value(&self) -> &Value {
        match self {
            Operand::Ref(value) => value,
            Operand::Owned(value) => value,
        }
    }

    fn into_owned(self) -> Value {
        match self {
            Operand::Ref(value) => value.clone(),
            Operand::Owned(value) => value,
        }
    }
}

/// Assignment step with its key already evaluated
enum Key<'s> {
    Attr(&'s str),
    Item(Value),
}

pub(crate) struct Interpreter<'a> {
    ctx: &'a CallContext<'a>,
    registry: &'a FunctionRegistry,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(ctx: &'a CallContext<'a>, registry: &'a FunctionRegistry) -> Self {
        Self { ctx, registry }
    }

    pub(crate) fn run(&self, code: &Code, frame: &mut Frame<'_>) -> Result<(), ConfinedError> {
        for stmt in code.statements() {
            self.exec(frame, stmt)?;
        }
        Ok(())
    }

    fn exec(&self, frame: &mut Frame<'_>, stmt: &Stmt) -> Result<(), ConfinedError> {
        match stmt {
            Stmt::Assign { target, value } => {
                let value = self.eval(frame, value)?.into_owned();
                self.assign(frame, target, value)
            }
            Stmt::Delete(name) => frame
                .unbind(name)
                .map(drop)
                .ok_or_else(|| name_error(name)),
            Stmt::Raise { kind, message } => {
                let message = match message {
                    Some(expr) => self.eval(frame, expr)?.value().to_string(),
                    None => String::new(),
                };
                Err(ConfinedError::new(kind.as_str(), message))
            }
            Stmt::Expr(expr) => self.eval(frame, expr).map(drop),
        }
    }

    fn assign(&self, frame: &mut Frame<'_>, target: &Target, value: Value) -> Result<(), ConfinedError> {
        if target.path.is_empty() {
            frame.bind(&target.root, value);
            return Ok(());
        }

        let mut keys = Vec::with_capacity(target.path.len());
        for step in &target.path {
            let key = match step {
                Accessor::Attr(name) => Key::Attr(name.as_str()),
                Accessor::Item(expr) => Key::Item(self.eval(frame, expr)?.into_owned()),
            };
            let checked = match &key {
                Key::Attr(name) => Some(*name),
                Key::Item(Value::Str(name)) => Some(name.as_str()),
                Key::Item(_) => None,
            };
            if let Some(name) = checked {
                if self.ctx.guard().is_name_denied(name) {
                    return Err(ConfinedError::access_denied(format!(
                        "access to '{}' is blocked",
                        name
                    )));
                }
            }
            keys.push(key);
        }

        let mut slot = frame
            .target_mut(&target.root)?
            .ok_or_else(|| name_error(&target.root))?;
        let Some((last, walk)) = keys.split_last() else {
            return Ok(());
        };
        for key in walk {
            slot = child_mut(slot, key)?;
        }
        store(slot, last, value)
    }

    fn eval<'e>(&'e self, frame: &'e Frame<'_>, expr: &Expr) -> Result<Operand<'e>, ConfinedError> {
        let guard = self.ctx.guard();
        match expr {
            Expr::Literal(value) => Ok(Operand::Owned(value.clone())),
            Expr::Name(name) => frame
                .lookup(name)
                .map(Operand::Ref)
                .ok_or_else(|| name_error(name)),
            Expr::List(items) => {
                let items = items
                    .iter()
                    .map(|item| self.eval(frame, item).map(Operand::into_owned))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Operand::Owned(Value::List(items)))
            }
            Expr::Map(entries) => {
                let mut map = std::collections::BTreeMap::new();
                for (key, item) in entries {
                    map.insert(key.clone(), self.eval(frame, item)?.into_owned());
                }
                Ok(Operand::Owned(Value::Map(map)))
            }
            Expr::Attr(base, name) => match self.eval(frame, base)? {
                Operand::Ref(value) => Ok(Operand::Ref(Proxy::new(value, guard).attr(name)?.target())),
                Operand::Owned(value) => Ok(Operand::Owned(
                    Proxy::new(&value, guard).attr(name)?.to_value(),
                )),
            },
            Expr::Item(base, key) => {
                let base = self.eval(frame, base)?;
                let key = self.eval(frame, key)?;
                match base {
                    Operand::Ref(value) => Ok(Operand::Ref(
                        Proxy::new(value, guard).item(key.value())?.target(),
                    )),
                    Operand::Owned(value) => Ok(Operand::Owned(
                        Proxy::new(&value, guard).item(key.value())?.to_value(),
                    )),
                }
            }
            Expr::Call {
                function,
                args,
                keywords,
            } => self.call(frame, function, args, keywords).map(Operand::Owned),
            Expr::Unary(op, operand) => {
                let operand = self.eval(frame, operand)?;
                unary(*op, operand.value()).map(Operand::Owned)
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(frame, left)?;
                let right = self.eval(frame, right)?;
                binary(*op, left.value(), right.value()).map(Operand::Owned)
            }
            Expr::And(left, right) => {
                let left = self.eval(frame, left)?;
                if left.value().is_truthy() {
                    self.eval(frame, right)
                } else {
                    Ok(left)
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval(frame, left)?;
                if left.value().is_truthy() {
                    Ok(left)
                } else {
                    self.eval(frame, right)
                }
            }
        }
    }

    fn call(
        &self,
        frame: &Frame<'_>,
        name: &str,
        args: &[Expr],
        keywords: &[(String, Expr)],
    ) -> Result<Value, ConfinedError> {
        let guard = self.ctx.guard();
        if guard.is_call_denied(name) {
            return Err(ConfinedError::access_denied(format!(
                "call to '{}' is blocked",
                name
            )));
        }
        let function = builtins::lookup(name)
            .or_else(|| self.registry.get(name))
            .ok_or_else(|| name_error(name))?;

        let positional = args
            .iter()
            .map(|arg| self.eval(frame, arg))
            .collect::<Result<Vec<_>, _>>()?;
        let mut named = Vec::with_capacity(keywords.len());
        for (key, arg) in keywords {
            named.push((key.as_str(), self.eval(frame, arg)?));
        }

        let call_args = CallArgs::from_parts(
            positional
                .iter()
                .map(|operand| Proxy::new(operand.value(), guard))
                .collect(),
            named
                .iter()
                .map(|(key, operand)| (*key, Proxy::new(operand.value(), guard)))
                .collect(),
        );
        function.invoke(self.ctx, &call_args)
    }
}

fn name_error(name: &str) -> ConfinedError {
    ConfinedError::name_error(name)
}

fn no_attribute(type_name: &str, name: &str) -> ConfinedError {
    ConfinedError::new(
        "AttributeError",
        format!("'{}' object has no attribute '{}'", type_name, name),
    )
}

fn bad_key(container: &str, key: &Value) -> ConfinedError {
    ConfinedError::type_error(format!(
        "invalid key of type '{}' for '{}'",
        key.type_name(),
        container
    ))
}

fn child_mut<'v>(slot: &'v mut Value, key: &Key<'_>) -> Result<&'v mut Value, ConfinedError> {
    let type_name = slot.type_name();
    match slot {
        Value::Map(entries) => match key {
            Key::Attr(name) => entries
                .get_mut(*name)
                .ok_or_else(|| no_attribute(type_name, name)),
            Key::Item(Value::Str(name)) => entries
                .get_mut(name.as_str())
                .ok_or_else(|| ConfinedError::new("KeyError", format!("{:?}", name))),
            Key::Item(other) => Err(bad_key(type_name, other)),
        },
        Value::List(items) => match key {
            Key::Attr(name) => Err(no_attribute(type_name, name)),
            Key::Item(Value::Int(index)) => match resolve_index(*index, items.len()) {
                Some(i) => Ok(&mut items[i]),
                None => Err(ConfinedError::new("IndexError", "list index out of range")),
            },
            Key::Item(other) => Err(bad_key(type_name, other)),
        },
        _ => match key {
            Key::Attr(name) => Err(no_attribute(type_name, name)),
            Key::Item(_) => Err(ConfinedError::type_error(format!(
                "'{}' object is not subscriptable",
                type_name
            ))),
        },
    }
}

fn store(slot: &mut Value, key: &Key<'_>, value: Value) -> Result<(), ConfinedError> {
    let type_name = slot.type_name();
    match slot {
        Value::Map(entries) => match key {
            Key::Attr(name) => {
                entries.insert((*name).to_string(), value);
                Ok(())
            }
            Key::Item(Value::Str(name)) => {
                entries.insert(name.clone(), value);
                Ok(())
            }
            Key::Item(other) => Err(bad_key(type_name, other)),
        },
        Value::List(items) => match key {
            Key::Attr(name) => Err(no_attribute(type_name, name)),
            Key::Item(Value::Int(index)) => match resolve_index(*index, items.len()) {
                Some(i) => {
                    items[i] = value;
                    Ok(())
                }
                None => Err(ConfinedError::new(
                    "IndexError",
                    "list assignment index out of range",
                )),
            },
            Key::Item(other) => Err(bad_key(type_name, other)),
        },
        _ => match key {
            Key::Attr(name) => Err(no_attribute(type_name, name)),
            Key::Item(_) => Err(ConfinedError::type_error(format!(
                "'{}' object does not support item assignment",
                type_name
            ))),
        },
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Num> {
        match value {
            Value::Int(i) => Some(Num::Int(*i)),
            Value::Bool(b) => Some(Num::Int(i64::from(*b))),
            Value::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn overflow() -> ConfinedError {
    ConfinedError::new("OverflowError", "integer overflow")
}

fn zero_division(message: &str) -> ConfinedError {
    ConfinedError::new("ZeroDivisionError", message)
}

fn unary(op: UnaryOp, operand: &Value) -> Result<Value, ConfinedError> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.is_truthy())),
        UnaryOp::Neg => match Num::of(operand) {
            Some(Num::Int(i)) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
            Some(Num::Float(f)) => Ok(Value::Float(-f)),
            None => Err(ConfinedError::type_error(format!(
                "bad operand type for unary -: '{}'",
                operand.type_name()
            ))),
        },
    }
}

fn unsupported(op: BinaryOp, left: &Value, right: &Value) -> ConfinedError {
    ConfinedError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

/// Reserve room for `len` more elements, failing with `MemoryError`
pub(crate) fn reserve<T>(out: &mut Vec<T>, len: usize) -> Result<(), ConfinedError> {
    out.try_reserve_exact(len)
        .map_err(|e| ConfinedError::memory_error(format!("cannot allocate {} items: {}", len, e)))
}

/// Length of `len` repeated `times` times; zero for non-positive counts
fn repeated_len(len: usize, times: i64) -> Result<usize, ConfinedError> {
    let times = usize::try_from(times).unwrap_or(0);
    len.checked_mul(times)
        .ok_or_else(|| ConfinedError::memory_error("repeated sequence is too long"))
}

fn repeat<T: Clone>(items: &[T], times: i64) -> Result<Vec<T>, ConfinedError> {
    let len = repeated_len(items.len(), times)?;
    let mut out = Vec::new();
    reserve(&mut out, len)?;
    while out.len() < len {
        out.extend_from_slice(items);
    }
    Ok(out)
}

fn repeat_str(s: &str, times: i64) -> Result<String, ConfinedError> {
    let len = repeated_len(s.len(), times)?;
    let mut out = String::new();
    out.try_reserve_exact(len)
        .map_err(|e| ConfinedError::memory_error(format!("cannot allocate {} bytes: {}", len, e)))?;
    while out.len() < len {
        out.push_str(s);
    }
    Ok(out)
}

fn concat<T: Clone>(a: &[T], b: &[T]) -> Result<Vec<T>, ConfinedError> {
    let mut out = Vec::new();
    reserve(&mut out, a.len().saturating_add(b.len()))?;
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    Ok(out)
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ConfinedError> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => return Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(op, left, right)?;
            let result = match (op, ordering) {
                (_, None) => false,
                (BinaryOp::Lt, Some(o)) => o == Ordering::Less,
                (BinaryOp::Le, Some(o)) => o != Ordering::Greater,
                (BinaryOp::Gt, Some(o)) => o == Ordering::Greater,
                (_, Some(o)) => o != Ordering::Less,
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    match (op, left, right) {
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => {
            let mut out = String::new();
            out.try_reserve_exact(a.len().saturating_add(b.len()))
                .map_err(|e| ConfinedError::memory_error(e.to_string()))?;
            out.push_str(a);
            out.push_str(b);
            return Ok(Value::Str(out));
        }
        (BinaryOp::Add, Value::List(a), Value::List(b)) => return Ok(Value::List(concat(a, b)?)),
        (BinaryOp::Add, Value::Bytes(a), Value::Bytes(b)) => return Ok(Value::Bytes(concat(a, b)?)),
        (BinaryOp::Mul, Value::Str(s), Value::Int(n)) | (BinaryOp::Mul, Value::Int(n), Value::Str(s)) => {
            return Ok(Value::Str(repeat_str(s, *n)?))
        }
        (BinaryOp::Mul, Value::List(items), Value::Int(n))
        | (BinaryOp::Mul, Value::Int(n), Value::List(items)) => {
            return Ok(Value::List(repeat(items, *n)?))
        }
        _ => {}
    }

    let (a, b) = match (Num::of(left), Num::of(right)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(unsupported(op, left, right)),
    };

    match (a, b) {
        (Num::Int(a), Num::Int(b)) => int_arith(op, a, b),
        _ => float_arith(op, a.as_f64(), b.as_f64()),
    }
}

fn int_arith(op: BinaryOp, a: i64, b: i64) -> Result<Value, ConfinedError> {
    let result = match op {
        BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinaryOp::Div => {
            if b == 0 {
                return Err(zero_division("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinaryOp::FloorDiv => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let quotient = a.checked_div(b).ok_or_else(overflow)?;
            if a % b != 0 && ((a < 0) != (b < 0)) {
                quotient - 1
            } else {
                quotient
            }
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let remainder = a.checked_rem(b).unwrap_or(0);
            if remainder != 0 && ((remainder < 0) != (b < 0)) {
                remainder + b
            } else {
                remainder
            }
        }
        _ => unreachable!("comparisons are handled before arithmetic"),
    };
    Ok(Value::Int(result))
}

fn float_arith(op: BinaryOp, a: f64, b: f64) -> Result<Value, ConfinedError> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            a / b
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Err(zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(zero_division("float modulo"));
            }
            let remainder = a % b;
            if remainder != 0.0 && ((remainder < 0.0) != (b < 0.0)) {
                remainder + b
            } else {
                remainder
            }
        }
        _ => unreachable!("comparisons are handled before arithmetic"),
    };
    Ok(Value::Float(result))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (Num::of(left), Num::of(right)) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => a == b,
        (Some(a), Some(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Option<Ordering>, ConfinedError> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        _ => match (Num::of(left), Num::of(right)) {
            (Some(Num::Int(a)), Some(Num::Int(b))) => Ok(Some(a.cmp(&b))),
            (Some(a), Some(b)) => Ok(a.as_f64().partial_cmp(&b.as_f64())),
            _ => Err(ConfinedError::type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ))),
        },
    }
}
