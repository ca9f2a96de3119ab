//! Run-time arithmetic, comparison, length and concatenation.
//!
//! Primitive cases first, metamethod fallback second. Integer arithmetic
//! traps on overflow; mixed integer/number operands promote to the
//! deterministic decimal; strings never coerce here (only `tonumber` and
//! concatenation convert).

use crate::engine::Engine;
use crate::types::*;
use crate::vm::metamethods::Metamethod;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
}

impl ArithOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Mod => "%",
            ArithOp::Pow => "^",
            ArithOp::Div => "/",
            ArithOp::IDiv => "//",
            ArithOp::BAnd => "&",
            ArithOp::BOr => "|",
            ArithOp::BXor => "~",
            ArithOp::Shl => "<<",
            ArithOp::Shr => ">>",
            ArithOp::Unm => "-",
            ArithOp::BNot => "~",
        }
    }

    fn metamethod(&self) -> Metamethod {
        match self {
            ArithOp::Add => Metamethod::Add,
            ArithOp::Sub => Metamethod::Sub,
            ArithOp::Mul => Metamethod::Mul,
            ArithOp::Mod => Metamethod::Mod,
            ArithOp::Pow => Metamethod::Pow,
            ArithOp::Div => Metamethod::Div,
            ArithOp::IDiv => Metamethod::IDiv,
            ArithOp::BAnd => Metamethod::BAnd,
            ArithOp::BOr => Metamethod::BOr,
            ArithOp::BXor => Metamethod::BXor,
            ArithOp::Shl => Metamethod::Shl,
            ArithOp::Shr => Metamethod::Shr,
            ArithOp::Unm => Metamethod::Unm,
            ArithOp::BNot => Metamethod::BNot,
        }
    }

    fn is_bitwise(&self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
                | ArithOp::BNot
        )
    }
}

fn as_integer_operand(value: Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(i),
        Value::Number(n) => n.to_i64(),
        _ => None,
    }
}

fn as_decimal_operand(value: Value) -> Option<Decimal> {
    match value {
        Value::Integer(i) => Some(Decimal::from_i64(i)),
        Value::Number(n) => Some(n),
        _ => None,
    }
}

fn integer_arith(op: ArithOp, a: i64, b: i64) -> Result<Value, RuntimeErrorKind> {
    let overflow = || RuntimeErrorKind::IntegerOverflow;
    let result = match op {
        ArithOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        ArithOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        ArithOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        ArithOp::Mod => {
            if b == 0 {
                return Err(RuntimeErrorKind::DivisionByZero);
            }
            // floored modulo: result takes the divisor's sign
            let r = a.checked_rem(b).ok_or_else(overflow)?;
            if r != 0 && (r < 0) != (b < 0) {
                r + b
            } else {
                r
            }
        }
        ArithOp::IDiv => {
            if b == 0 {
                return Err(RuntimeErrorKind::DivisionByZero);
            }
            let q = a.checked_div(b).ok_or_else(overflow)?;
            if a % b != 0 && (a < 0) != (b < 0) {
                q - 1
            } else {
                q
            }
        }
        ArithOp::Unm => a.checked_neg().ok_or_else(overflow)?,
        ArithOp::Pow => {
            if b < 0 {
                return Err(RuntimeErrorKind::BadExponent);
            }
            let exp = u32::try_from(b).map_err(|_| RuntimeErrorKind::IntegerOverflow)?;
            a.checked_pow(exp).ok_or_else(overflow)?
        }
        ArithOp::Div => {
            // `/` is the exact division and always produces a number
            if b == 0 {
                return Err(RuntimeErrorKind::DivisionByZero);
            }
            let q = Decimal::from_i64(a)
                .checked_div(Decimal::from_i64(b))
                .ok_or_else(overflow)?;
            return Ok(Value::Number(q));
        }
        _ => unreachable!("bitwise handled separately"),
    };
    Ok(Value::Integer(result))
}

fn decimal_arith(op: ArithOp, a: Decimal, b: Decimal) -> Result<Value, RuntimeErrorKind> {
    let overflow = || RuntimeErrorKind::IntegerOverflow;
    let zero_check = |d: Decimal| {
        if d.is_zero() {
            Err(RuntimeErrorKind::DivisionByZero)
        } else {
            Ok(())
        }
    };
    let result = match op {
        ArithOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        ArithOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        ArithOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        ArithOp::Div => {
            zero_check(b)?;
            a.checked_div(b).ok_or_else(overflow)?
        }
        ArithOp::IDiv => {
            zero_check(b)?;
            a.checked_floor_div(b).ok_or_else(overflow)?
        }
        ArithOp::Mod => {
            zero_check(b)?;
            a.checked_rem(b).ok_or_else(overflow)?
        }
        ArithOp::Unm => a.checked_neg().ok_or_else(overflow)?,
        ArithOp::Pow => {
            let exp = b
                .to_i64()
                .filter(|e| *e >= 0)
                .ok_or(RuntimeErrorKind::BadExponent)?;
            let exp = u32::try_from(exp).map_err(|_| RuntimeErrorKind::IntegerOverflow)?;
            a.checked_powi(exp).ok_or_else(overflow)?
        }
        _ => unreachable!("bitwise handled separately"),
    };
    Ok(Value::Number(result))
}

fn bitwise_arith(op: ArithOp, a: i64, b: i64) -> Value {
    let (ua, ub) = (a as u64, b as u64);
    let result = match op {
        ArithOp::BAnd => ua & ub,
        ArithOp::BOr => ua | ub,
        ArithOp::BXor => ua ^ ub,
        ArithOp::BNot => !ua,
        ArithOp::Shl => shift_left(ua, b),
        // wrapping_neg: i64::MIN stays i64::MIN, which the magnitude
        // check below maps to 0 like every other out-of-range count
        ArithOp::Shr => shift_left(ua, b.wrapping_neg()),
        _ => unreachable!(),
    };
    Value::Integer(result as i64)
}

/// Shift with the "any shift >= 64 yields 0" rule; negative counts shift
/// the other way.
fn shift_left(value: u64, count: i64) -> u64 {
    if count >= 64 || count <= -64 {
        0
    } else if count >= 0 {
        value << count
    } else {
        value >> -count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_counts_beyond_width_yield_zero() {
        assert_eq!(bitwise_arith(ArithOp::Shl, 1, 64), Value::Integer(0));
        assert_eq!(bitwise_arith(ArithOp::Shr, 1, 64), Value::Integer(0));
        assert_eq!(bitwise_arith(ArithOp::Shl, 1, i64::MAX), Value::Integer(0));
        assert_eq!(bitwise_arith(ArithOp::Shr, -1, i64::MAX), Value::Integer(0));
        // the extreme negative count must not panic and must agree across
        // build profiles
        assert_eq!(bitwise_arith(ArithOp::Shr, -1, i64::MIN), Value::Integer(0));
        assert_eq!(bitwise_arith(ArithOp::Shl, -1, i64::MIN), Value::Integer(0));
    }

    #[test]
    fn test_negative_counts_shift_the_other_way() {
        assert_eq!(bitwise_arith(ArithOp::Shl, 8, -2), Value::Integer(2));
        assert_eq!(bitwise_arith(ArithOp::Shr, 8, -2), Value::Integer(32));
        assert_eq!(bitwise_arith(ArithOp::Shr, 8, 2), Value::Integer(2));
    }
}

/// The primitive attempt of one arithmetic/bitwise instruction. `None`
/// means the operands do not support it and the metamethod should fire.
fn raw_arith(op: ArithOp, a: Value, b: Value) -> Option<Result<Value, RuntimeErrorKind>> {
    if op.is_bitwise() {
        let ia = as_integer_operand(a)?;
        let ib = if matches!(op, ArithOp::BNot) {
            0
        } else {
            as_integer_operand(b)?
        };
        return Some(Ok(bitwise_arith(op, ia, ib)));
    }
    match (a, b) {
        (Value::Integer(ia), Value::Integer(ib)) => Some(integer_arith(op, ia, ib)),
        _ => {
            let da = as_decimal_operand(a)?;
            let db = if matches!(op, ArithOp::Unm) {
                Decimal::ZERO
            } else {
                as_decimal_operand(b)?
            };
            Some(decimal_arith(op, da, db))
        }
    }
}

impl<'h> Engine<'h> {
    pub(crate) fn arith(&mut self, op: ArithOp, a: Value, b: Value) -> Result<Value, EngineError> {
        // unary ops pass the operand twice, as the dispatch convention
        if matches!(op, ArithOp::Unm) {
            if let Value::Integer(i) = a {
                return integer_arith(op, i, 0).map_err(EngineError::from);
            }
        }
        if let Some(result) = raw_arith(op, a, b) {
            return result.map_err(EngineError::from);
        }
        let event = op.metamethod();
        let handler = self
            .metamethod(a, event)
            .or_else(|| self.metamethod(b, event));
        match handler {
            Some(handler) => {
                let results = self.call_value(handler, vec![a, b])?;
                Ok(results.first().copied().unwrap_or(Value::Nil))
            }
            None => {
                if op.is_bitwise() {
                    let offender = if as_integer_operand(a).is_none() { a } else { b };
                    Err(RuntimeErrorKind::BitwiseOnNonInteger {
                        type_name: offender.type_name(),
                    }
                    .into())
                } else {
                    let offender = if as_decimal_operand(a).is_none() { a } else { b };
                    Err(RuntimeErrorKind::ArithOnNonNumber {
                        op: op.symbol(),
                        type_name: offender.type_name(),
                    }
                    .into())
                }
            }
        }
    }

    /// `==` with the `__eq` rule: the metamethod fires only when both
    /// operands share a type and are raw-unequal.
    pub(crate) fn values_equal(&mut self, a: Value, b: Value) -> Result<bool, EngineError> {
        if a.raw_equals(&b) {
            return Ok(true);
        }
        let comparable = matches!(
            (a, b),
            (Value::Table(_), Value::Table(_)) | (Value::Userdata(_), Value::Userdata(_))
        );
        if !comparable {
            return Ok(false);
        }
        let handler = self
            .metamethod(a, Metamethod::Eq)
            .or_else(|| self.metamethod(b, Metamethod::Eq));
        match handler {
            None => Ok(false),
            Some(handler) => {
                let results = self.call_value(handler, vec![a, b])?;
                Ok(results.first().copied().unwrap_or(Value::Nil).truthy())
            }
        }
    }

    pub(crate) fn less_than(&mut self, a: Value, b: Value) -> Result<bool, EngineError> {
        self.order_compare(a, b, Metamethod::Lt)
    }

    pub(crate) fn less_equal(&mut self, a: Value, b: Value) -> Result<bool, EngineError> {
        self.order_compare(a, b, Metamethod::Le)
    }

    fn order_compare(
        &mut self,
        a: Value,
        b: Value,
        event: Metamethod,
    ) -> Result<bool, EngineError> {
        if let Some(ordering) = self.primitive_order(a, b) {
            return Ok(match event {
                Metamethod::Lt => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            });
        }
        let handler = self.metamethod(a, event).or_else(|| self.metamethod(b, event));
        match handler {
            Some(handler) => {
                let results = self.call_value(handler, vec![a, b])?;
                Ok(results.first().copied().unwrap_or(Value::Nil).truthy())
            }
            None => Err(RuntimeErrorKind::CompareTypeMismatch {
                lhs: a.type_name(),
                rhs: b.type_name(),
            }
            .into()),
        }
    }

    /// Exact ordering for number/number and string/string pairs.
    fn primitive_order(&self, a: Value, b: Value) -> Option<Ordering> {
        match (a, b) {
            (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(&y)),
            (Value::Integer(x), Value::Number(y)) => Some(y.cmp_i64(x).reverse()),
            (Value::Number(x), Value::Integer(y)) => Some(x.cmp_i64(y)),
            (Value::Number(x), Value::Number(y)) => Some(x.cmp(&y)),
            (Value::String(x), Value::String(y)) => {
                Some(self.heap.string_bytes(x).cmp(self.heap.string_bytes(y)))
            }
            _ => None,
        }
    }

    /// `#v`, with `__len` for tables carrying one and for userdata.
    pub(crate) fn length_of(&mut self, value: Value) -> Result<Value, EngineError> {
        if let Value::String(r) = value {
            return Ok(Value::Integer(self.heap.string(r).len() as i64));
        }
        if let Some(handler) = self.metamethod(value, Metamethod::Len) {
            let results = self.call_value(handler, vec![value])?;
            return Ok(results.first().copied().unwrap_or(Value::Nil));
        }
        if let Value::Table(r) = value {
            return Ok(Value::Integer(self.heap.table(r).length()));
        }
        Err(RuntimeErrorKind::LengthTypeError {
            type_name: value.type_name(),
        }
        .into())
    }

    /// Concatenation of two values; strings and numbers concatenate
    /// primitively, everything else goes through `__concat`.
    pub(crate) fn concat_pair(&mut self, a: Value, b: Value) -> Result<Value, EngineError> {
        let a_str = self.coerce_to_bytes(a);
        let b_str = self.coerce_to_bytes(b);
        match (a_str, b_str) {
            (Some(mut bytes), Some(more)) => {
                bytes.extend(more);
                Ok(Value::String(self.heap.intern(&bytes)))
            }
            _ => {
                let handler = self
                    .metamethod(a, Metamethod::Concat)
                    .or_else(|| self.metamethod(b, Metamethod::Concat));
                match handler {
                    Some(handler) => {
                        let results = self.call_value(handler, vec![a, b])?;
                        Ok(results.first().copied().unwrap_or(Value::Nil))
                    }
                    None => {
                        let offender = if self.coerce_to_bytes(a).is_none() { a } else { b };
                        Err(RuntimeErrorKind::ConcatTypeError {
                            type_name: offender.type_name(),
                        }
                        .into())
                    }
                }
            }
        }
    }

    fn coerce_to_bytes(&self, value: Value) -> Option<Vec<u8>> {
        match value {
            Value::String(r) => Some(self.heap.string_bytes(r).to_vec()),
            Value::Integer(i) => Some(i.to_string().into_bytes()),
            Value::Number(n) => Some(n.to_string().into_bytes()),
            _ => None,
        }
    }

    /// The canonical display form of any value, as `tostring` sees it.
    pub fn display_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(r) => self.heap.string_lossy(r),
            Value::Table(r) => format!("table: 0x{:08x}", r.index()),
            Value::Function(r) => format!("function: 0x{:08x}", r.index()),
            Value::Userdata(r) => format!("userdata: 0x{:08x}", r.index()),
            Value::LightUserdata(p) => format!("userdata: 0x{:016x}", p),
            Value::Thread(r) => format!("thread: 0x{:08x}", r.index()),
        }
    }

    /// Explicit string-to-number conversion, integer form preferred.
    pub fn coerce_to_number(&self, value: Value) -> Option<Value> {
        match value {
            Value::Integer(_) | Value::Number(_) => Some(value),
            Value::String(r) => {
                let text = self.heap.string_lossy(r);
                let text = text.trim();
                if let Ok(i) = text.parse::<i64>() {
                    return Some(Value::Integer(i));
                }
                text.parse::<Decimal>().ok().map(Value::Number)
            }
            _ => None,
        }
    }
}
