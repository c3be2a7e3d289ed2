//! Registered predicate filters and their compiled form.
//!
//! A filter's condition arrives here already compiled (the expression
//! front end lives outside this crate) as a flat postfix instruction
//! sequence evaluated over a small value stack, one event at a time.
//! Evaluation is total: a malformed program, a type mismatch, or a
//! division by zero means the event does not match; the hot path never
//! panics.

use crate::schema::{AttrValue, EventView};

/// One instruction of a compiled predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// Push the attribute at this schema index.
    PushAttr(u16),
    /// Push an integer constant.
    PushInt(i64),
    /// Push a float constant.
    PushFloat(f64),
    /// Push a boolean constant.
    PushBool(bool),
    /// Push a string constant.
    PushStr(String),
    /// Pop two, push `a == b`.
    Eq,
    /// Pop two, push `a != b`.
    Ne,
    /// Pop two, push `a < b`.
    Lt,
    /// Pop two, push `a <= b`.
    Le,
    /// Pop two, push `a > b`.
    Gt,
    /// Pop two, push `a >= b`.
    Ge,
    /// Pop two numerics, push `a + b`.
    Add,
    /// Pop two numerics, push `a - b`.
    Sub,
    /// Pop two numerics, push `a * b`.
    Mul,
    /// Pop two numerics, push `a / b`.
    Div,
    /// Pop two numerics, push `a % b`.
    Mod,
    /// Pop two booleans, push `a && b`.
    And,
    /// Pop two booleans, push `a || b`.
    Or,
    /// Pop one boolean, push `!a`.
    Not,
}

/// Runtime value on the evaluation stack.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Value<'a> {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(&'a str),
}

impl<'a> Value<'a> {
    fn from_attr(attr: AttrValue<'a>) -> Self {
        match attr {
            AttrValue::Bool(v) => Value::Bool(v),
            AttrValue::Int(v) => Value::Int(v as i64),
            AttrValue::Long(v) => Value::Int(v),
            AttrValue::Float(v) => Value::Float(v as f64),
            AttrValue::Double(v) => Value::Float(v),
            AttrValue::Str(v) => Value::Str(v),
        }
    }

    fn as_f64(self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(v as f64),
            Value::Float(v) => Some(v),
            _ => None,
        }
    }
}

/// A compiled predicate program.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterProgram {
    instrs: Vec<Instr>,
}

impl FilterProgram {
    /// Wrap an instruction sequence.
    pub fn new(instrs: Vec<Instr>) -> Self {
        Self { instrs }
    }

    /// Instruction count.
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    /// Whether the program is empty. Empty programs match nothing.
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Evaluate the predicate against one event.
    ///
    /// Returns `false` for any failure mode: empty program, stack
    /// underflow, leftover operands, type mismatch, missing attribute,
    /// or division by zero.
    pub fn evaluate(&self, event: &EventView<'_>) -> bool {
        if self.instrs.is_empty() {
            return false;
        }
        let mut stack: Vec<Value<'_>> = Vec::with_capacity(8);
        for instr in &self.instrs {
            let ok = match instr {
                Instr::PushAttr(idx) => match event.attribute(*idx as usize) {
                    Some(attr) => {
                        stack.push(Value::from_attr(attr));
                        true
                    }
                    None => false,
                },
                Instr::PushInt(v) => {
                    stack.push(Value::Int(*v));
                    true
                }
                Instr::PushFloat(v) => {
                    stack.push(Value::Float(*v));
                    true
                }
                Instr::PushBool(v) => {
                    stack.push(Value::Bool(*v));
                    true
                }
                Instr::PushStr(v) => {
                    stack.push(Value::Str(v.as_str()));
                    true
                }
                Instr::Eq => binary_cmp(&mut stack, CmpOp::Eq),
                Instr::Ne => binary_cmp(&mut stack, CmpOp::Ne),
                Instr::Lt => binary_cmp(&mut stack, CmpOp::Lt),
                Instr::Le => binary_cmp(&mut stack, CmpOp::Le),
                Instr::Gt => binary_cmp(&mut stack, CmpOp::Gt),
                Instr::Ge => binary_cmp(&mut stack, CmpOp::Ge),
                Instr::Add => binary_arith(&mut stack, ArithOp::Add),
                Instr::Sub => binary_arith(&mut stack, ArithOp::Sub),
                Instr::Mul => binary_arith(&mut stack, ArithOp::Mul),
                Instr::Div => binary_arith(&mut stack, ArithOp::Div),
                Instr::Mod => binary_arith(&mut stack, ArithOp::Mod),
                Instr::And => binary_logic(&mut stack, LogicOp::And),
                Instr::Or => binary_logic(&mut stack, LogicOp::Or),
                Instr::Not => match stack.pop() {
                    Some(Value::Bool(v)) => {
                        stack.push(Value::Bool(!v));
                        true
                    }
                    _ => false,
                },
            };
            if !ok {
                return false;
            }
        }
        matches!(stack.as_slice(), [Value::Bool(true)])
    }
}

#[derive(Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn binary_cmp(stack: &mut Vec<Value<'_>>, op: CmpOp) -> bool {
    let (Some(rhs), Some(lhs)) = (stack.pop(), stack.pop()) else {
        return false;
    };
    let result = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        },
        (Value::Str(a), Value::Str(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            // Strings order-compare nowhere in the pipeline.
            _ => return false,
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            _ => return false,
        },
        (lhs, rhs) => {
            let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
                return false;
            };
            match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
            }
        }
    };
    stack.push(Value::Bool(result));
    true
}

#[derive(Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

fn binary_arith(stack: &mut Vec<Value<'_>>, op: ArithOp) -> bool {
    let (Some(rhs), Some(lhs)) = (stack.pop(), stack.pop()) else {
        return false;
    };
    let result = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => {
            let v = match op {
                ArithOp::Add => a.checked_add(b),
                ArithOp::Sub => a.checked_sub(b),
                ArithOp::Mul => a.checked_mul(b),
                ArithOp::Div => a.checked_div(b),
                ArithOp::Mod => a.checked_rem(b),
            };
            match v {
                Some(v) => Value::Int(v),
                None => return false,
            }
        }
        (lhs, rhs) => {
            let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
                return false;
            };
            let v = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => {
                    if b == 0.0 {
                        return false;
                    }
                    a / b
                }
                ArithOp::Mod => {
                    if b == 0.0 {
                        return false;
                    }
                    a % b
                }
            };
            Value::Float(v)
        }
    };
    stack.push(result);
    true
}

#[derive(Clone, Copy)]
enum LogicOp {
    And,
    Or,
}

fn binary_logic(stack: &mut Vec<Value<'_>>, op: LogicOp) -> bool {
    let (Some(Value::Bool(b)), Some(Value::Bool(a))) = (stack.pop(), stack.pop()) else {
        return false;
    };
    stack.push(Value::Bool(match op {
        LogicOp::And => a && b,
        LogicOp::Or => a || b,
    }));
    true
}

/// A registered predicate: a unique id plus its compiled condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    /// Unique filter id within a consumer.
    pub id: u32,
    /// Compiled condition.
    pub program: FilterProgram,
}

impl Filter {
    /// Pair an id with a compiled program.
    pub fn new(id: u32, program: FilterProgram) -> Self {
        Self { id, program }
    }
}

/// Opaque handle to a filter table uploaded to a device.
///
/// The table is immutable once uploaded; kernels reference it by handle
/// and all device threads may read it concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterTableHandle(pub u64);
