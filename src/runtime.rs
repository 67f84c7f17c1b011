//! Runtime module responsible for executing the bytecode of a loaded
//! program.
//!
//! Each method invocation evaluates inside its own frame : an operand
//! stack bounded by the method's declared `max_stack`, a local variable
//! array sized `max_locals` and a program counter into the code bytes.
//! `invokestatic` re-enters the evaluator recursively with a fresh frame,
//! so the host call stack doubles as the JVM frame stack. The heap of
//! integer arrays is shared by every frame of the run.
use crate::bytecode::OPCode;
use crate::heap::Heap;
use crate::program::Program;

use std::fmt;

/// `RuntimeErrorKind` represents the possible faults that can occur while
/// executing bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    MissingOperands(OPCode),
    UnknownOpcode(u8),
    UnexpectedEndOfCode,
    StackOverflow(OPCode),
    StackUnderflow(OPCode),
    InvalidLocalIndex(usize),
    InvalidBranchTarget(i32),
    DivisionByZero(OPCode),
    NegativeShiftAmount(i32),
    InvalidConstantPoolEntry(usize),
    UnresolvedMethodRef(usize),
    NegativeArraySize(i32),
    MissingEntryPoint,
    EntryPointReturnedValue(i32),
}

/// `RuntimeError` is a custom type used to handle and represent
/// execution failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    kind: RuntimeErrorKind,
}

impl RuntimeError {
    const fn new(kind: RuntimeErrorKind) -> Self {
        Self { kind }
    }

    /// Returns the kind of fault this error reports.
    pub const fn kind(&self) -> &RuntimeErrorKind {
        &self.kind
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            RuntimeErrorKind::MissingOperands(opcode) => {
                write!(f, "instruction {opcode} decoded without its operands")
            }
            RuntimeErrorKind::UnknownOpcode(byte) => {
                write!(f, "unknown opcode {byte:#04x}")
            }
            RuntimeErrorKind::UnexpectedEndOfCode => {
                write!(f, "instruction runs past the end of the code array")
            }
            RuntimeErrorKind::StackOverflow(opcode) => {
                write!(f, "operand stack overflow at {opcode}")
            }
            RuntimeErrorKind::StackUnderflow(opcode) => {
                write!(f, "operand stack underflow at {opcode}")
            }
            RuntimeErrorKind::InvalidLocalIndex(index) => {
                write!(f, "local variable index {index} is out of range")
            }
            RuntimeErrorKind::InvalidBranchTarget(offset) => {
                write!(
                    f,
                    "branch offset {offset} lands outside the code array"
                )
            }
            RuntimeErrorKind::DivisionByZero(opcode) => {
                write!(f, "{opcode} with a zero divisor")
            }
            RuntimeErrorKind::NegativeShiftAmount(amount) => {
                write!(f, "shift amount {amount} is negative")
            }
            RuntimeErrorKind::InvalidConstantPoolEntry(index) => {
                write!(
                    f,
                    "constant pool entry {index} is not an integer constant"
                )
            }
            RuntimeErrorKind::UnresolvedMethodRef(index) => {
                write!(
                    f,
                    "constant pool entry {index} does not name a method of \
                     this class"
                )
            }
            RuntimeErrorKind::NegativeArraySize(size) => {
                write!(f, "cannot allocate an array of negative size {size}")
            }
            RuntimeErrorKind::MissingEntryPoint => {
                write!(f, "class has no main method")
            }
            RuntimeErrorKind::EntryPointReturnedValue(value) => {
                write!(f, "main returned {value} but must return void")
            }
        }
    }
}

/// Instructions are composed of an opcode and a list of decoded operands.
/// Multi-byte immediates arrive sign-extended, `ldc` constants resolved
/// and `invokestatic` targets mapped to method table indices.
#[derive(Debug, Clone)]
pub struct Instruction {
    mnemonic: OPCode,
    operands: Option<Vec<i32>>,
}

impl Instruction {
    /// Creates a new instruction.
    pub fn new(mnemonic: OPCode, operands: Option<Vec<i32>>) -> Self {
        Self { mnemonic, operands }
    }

    /// Returns the instruction mnemonic.
    pub const fn mnemonic(&self) -> OPCode {
        self.mnemonic
    }

    /// Returns the nth operand of an instruction.
    pub fn nth(&self, index: usize) -> Option<i32> {
        self.operands.as_ref().and_then(|ops| ops.get(index).copied())
    }
}

/// Outcome of evaluating a single instruction.
enum State {
    Running,
    Returned(Option<i32>),
}

/// Frames store data and partial results within a method's scope. Each
/// frame has a program counter, a bounded operand stack and an array of
/// local variables. References and integers share the same 32-bit slots;
/// the opcode decides the interpretation.
#[derive(Debug)]
struct Frame {
    pc: usize,
    code_len: usize,
    max_stack: usize,
    stack: Vec<i32>,
    locals: Vec<i32>,
}

impl Frame {
    fn new(max_stack: usize, code_len: usize, locals: Vec<i32>) -> Self {
        Self {
            pc: 0,
            code_len,
            max_stack,
            stack: Vec::with_capacity(max_stack),
            locals,
        }
    }

    /// Push a value onto the operand stack.
    fn push(&mut self, value: i32, at: OPCode) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.max_stack {
            return Err(RuntimeError::new(RuntimeErrorKind::StackOverflow(at)));
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pop a value from the operand stack.
    fn pop(&mut self, at: OPCode) -> Result<i32, RuntimeError> {
        self.stack
            .pop()
            .ok_or(RuntimeError::new(RuntimeErrorKind::StackUnderflow(at)))
    }

    /// Push the local at `index` onto the stack.
    fn load(&mut self, index: usize, at: OPCode) -> Result<(), RuntimeError> {
        let value = *self.locals.get(index).ok_or(RuntimeError::new(
            RuntimeErrorKind::InvalidLocalIndex(index),
        ))?;
        self.push(value, at)
    }

    /// Pop the top of the stack into the local at `index`.
    fn store(&mut self, index: usize, at: OPCode) -> Result<(), RuntimeError> {
        let value = self.pop(at)?;
        let slot = self.locals.get_mut(index).ok_or(RuntimeError::new(
            RuntimeErrorKind::InvalidLocalIndex(index),
        ))?;
        *slot = value;
        Ok(())
    }

    /// Branch with an offset relative to the current opcode's address.
    /// The program counter has already advanced three bytes past the
    /// opcode when a branch evaluates, hence the rewind.
    fn jump(&mut self, offset: i32) -> Result<(), RuntimeError> {
        let target = self.pc as i64 + i64::from(offset) - 3;
        if target < 0 || target > self.code_len as i64 {
            return Err(RuntimeError::new(
                RuntimeErrorKind::InvalidBranchTarget(offset),
            ));
        }
        self.pc = target as usize;
        Ok(())
    }
}

/// `Runtime` represents an execution context for a loaded program. It
/// owns the heap shared by every invocation and interprets one method at
/// a time, entering callees through host recursion.
pub struct Runtime {
    program: Program,
    heap: Heap,
}

impl Runtime {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            heap: Heap::new(),
        }
    }

    /// Read access to the heap, mostly useful to inspect arrays after a
    /// method returned a reference.
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Locates `main` and runs it with zero-filled locals. Faults if the
    /// class has no entry point or if `main` returns a value.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        let main_index = self
            .program
            .entry_point()
            .ok_or(RuntimeError::new(RuntimeErrorKind::MissingEntryPoint))?;
        let locals =
            vec![0; self.program.method(main_index).max_locals() as usize];
        match self.execute(main_index, locals)? {
            None => Ok(()),
            Some(value) => Err(RuntimeError::new(
                RuntimeErrorKind::EntryPointReturnedValue(value),
            )),
        }
    }

    /// Runs a single method until it returns. `locals` must hold the
    /// parameters in slots `[0, param_count)` and zeroes elsewhere.
    /// Returns the method's result, `None` for void. A method whose
    /// control flow walks past the last instruction returns void.
    pub fn execute(
        &mut self,
        method_index: usize,
        locals: Vec<i32>,
    ) -> Result<Option<i32>, RuntimeError> {
        let method = self.program.method(method_index);
        let max_stack = method.max_stack() as usize;
        let code_len = method.code().len();
        let mut frame = Frame::new(max_stack, code_len, locals);
        while frame.pc < code_len {
            let inst = self.fetch(method_index, &mut frame)?;
            match self.eval(&inst, &mut frame)? {
                State::Running => (),
                State::Returned(value) => return Ok(value),
            }
        }
        Ok(None)
    }

    /// Returns the next bytecode value in the current method.
    fn next(
        &self,
        method_index: usize,
        frame: &mut Frame,
    ) -> Result<u8, RuntimeError> {
        let code = self.program.method(method_index).code();
        let byte = code.get(frame.pc).copied().ok_or(RuntimeError::new(
            RuntimeErrorKind::UnexpectedEndOfCode,
        ))?;
        frame.pc += 1;
        Ok(byte)
    }

    /// Returns a 16-bit big-endian immediate sign-extended to `i32`.
    const fn encode_arg(hi: u8, lo: u8) -> i32 {
        ((hi as u16) << 8 | lo as u16) as i16 as i32
    }

    /// Decodes the instruction at the program counter, advancing past its
    /// encoded length. Unknown opcodes are a fatal decode error rather
    /// than a skip, a byte that doesn't decode leaves the stream
    /// unsynchronized.
    fn fetch(
        &self,
        method_index: usize,
        frame: &mut Frame,
    ) -> Result<Instruction, RuntimeError> {
        let byte = self.next(method_index, frame)?;
        let mnemonic = OPCode::from(byte);
        let operands = match mnemonic {
            OPCode::Unspecified => {
                return Err(RuntimeError::new(
                    RuntimeErrorKind::UnknownOpcode(byte),
                ));
            }
            // 16-bit signed immediates.
            OPCode::SiPush
            | OPCode::IfEq
            | OPCode::IfNe
            | OPCode::IfLt
            | OPCode::IfGe
            | OPCode::IfGt
            | OPCode::IfLe
            | OPCode::IfICmpEq
            | OPCode::IfICmpNe
            | OPCode::IfICmpLt
            | OPCode::IfICmpGe
            | OPCode::IfICmpGt
            | OPCode::IfICmpLe
            | OPCode::Goto => {
                let hi = self.next(method_index, frame)?;
                let lo = self.next(method_index, frame)?;
                Some(vec![Self::encode_arg(hi, lo)])
            }
            // 8-bit signed immediate.
            OPCode::BiPush => {
                let byte = self.next(method_index, frame)?;
                Some(vec![i32::from(byte as i8)])
            }
            // 8-bit unsigned local index.
            OPCode::ILoad | OPCode::ALoad | OPCode::IStore | OPCode::AStore => {
                Some(vec![i32::from(self.next(method_index, frame)?)])
            }
            // Local index plus signed increment.
            OPCode::IInc => {
                let index = i32::from(self.next(method_index, frame)?);
                let constant = i32::from(self.next(method_index, frame)? as i8);
                Some(vec![index, constant])
            }
            // Constant pool load, resolved during decode.
            OPCode::Ldc => {
                let index = usize::from(self.next(method_index, frame)?);
                let value =
                    self.program.integer_constant(index).ok_or(
                        RuntimeError::new(
                            RuntimeErrorKind::InvalidConstantPoolEntry(index),
                        ),
                    )?;
                Some(vec![value])
            }
            // Static call target, resolved to a method table index.
            OPCode::InvokeStatic => {
                let hi = self.next(method_index, frame)?;
                let lo = self.next(method_index, frame)?;
                let cp_index = Self::encode_arg(hi, lo) as usize;
                let callee =
                    self.program.find_method_from_index(cp_index).ok_or(
                        RuntimeError::new(
                            RuntimeErrorKind::UnresolvedMethodRef(cp_index),
                        ),
                    )?;
                Some(vec![callee as i32])
            }
            // Two-byte constant pool index, consumed but not consulted.
            OPCode::GetStatic | OPCode::InvokeVirtual => {
                let hi = self.next(method_index, frame)?;
                let lo = self.next(method_index, frame)?;
                Some(vec![Self::encode_arg(hi, lo)])
            }
            // Array element type tag, only integer arrays exist here.
            OPCode::NewArray => {
                Some(vec![i32::from(self.next(method_index, frame)?)])
            }
            _ => None,
        };
        Ok(Instruction::new(mnemonic, operands))
    }

    /// Evaluate a single decoded instruction against the current frame.
    fn eval(
        &mut self,
        inst: &Instruction,
        frame: &mut Frame,
    ) -> Result<State, RuntimeError> {
        let at = inst.mnemonic();
        let operand = |index: usize| {
            inst.nth(index).ok_or(RuntimeError::new(
                RuntimeErrorKind::MissingOperands(at),
            ))
        };
        match at {
            OPCode::NOP => (),
            // Constants.
            OPCode::IconstM1 => frame.push(-1, at)?,
            OPCode::Iconst0 => frame.push(0, at)?,
            OPCode::Iconst1 => frame.push(1, at)?,
            OPCode::Iconst2 => frame.push(2, at)?,
            OPCode::Iconst3 => frame.push(3, at)?,
            OPCode::Iconst4 => frame.push(4, at)?,
            OPCode::Iconst5 => frame.push(5, at)?,
            OPCode::BiPush | OPCode::SiPush | OPCode::Ldc => {
                frame.push(operand(0)?, at)?;
            }
            // Local variable moves.
            OPCode::ILoad | OPCode::ALoad => {
                frame.load(operand(0)? as usize, at)?;
            }
            OPCode::ILoad0 | OPCode::ALoad0 => frame.load(0, at)?,
            OPCode::ILoad1 | OPCode::ALoad1 => frame.load(1, at)?,
            OPCode::ILoad2 | OPCode::ALoad2 => frame.load(2, at)?,
            OPCode::ILoad3 | OPCode::ALoad3 => frame.load(3, at)?,
            OPCode::IStore | OPCode::AStore => {
                frame.store(operand(0)? as usize, at)?;
            }
            OPCode::IStore0 | OPCode::AStore0 => frame.store(0, at)?,
            OPCode::IStore1 | OPCode::AStore1 => frame.store(1, at)?,
            OPCode::IStore2 | OPCode::AStore2 => frame.store(2, at)?,
            OPCode::IStore3 | OPCode::AStore3 => frame.store(3, at)?,
            OPCode::IInc => {
                let index = operand(0)? as usize;
                let constant = operand(1)?;
                let slot = frame.locals.get_mut(index).ok_or(
                    RuntimeError::new(RuntimeErrorKind::InvalidLocalIndex(
                        index,
                    )),
                )?;
                *slot = slot.wrapping_add(constant);
            }
            // Arithmetic and bitwise operations. The right-hand side sits
            // on top of the stack. Integer arithmetic wraps.
            OPCode::IAdd => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                frame.push(lhs.wrapping_add(rhs), at)?;
            }
            OPCode::ISub => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                frame.push(lhs.wrapping_sub(rhs), at)?;
            }
            OPCode::IMul => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                frame.push(lhs.wrapping_mul(rhs), at)?;
            }
            OPCode::IDiv => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                if rhs == 0 {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::DivisionByZero(at),
                    ));
                }
                frame.push(lhs.wrapping_div(rhs), at)?;
            }
            OPCode::IRem => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                if rhs == 0 {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::DivisionByZero(at),
                    ));
                }
                frame.push(lhs.wrapping_rem(rhs), at)?;
            }
            OPCode::INeg => {
                let value = frame.pop(at)?;
                frame.push(value.wrapping_neg(), at)?;
            }
            // Shifts require a non-negative amount; the distance is
            // masked to the low five bits as the JVM does.
            OPCode::IShl => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                if rhs < 0 {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::NegativeShiftAmount(rhs),
                    ));
                }
                frame.push(lhs.wrapping_shl(rhs as u32), at)?;
            }
            OPCode::IShr => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                if rhs < 0 {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::NegativeShiftAmount(rhs),
                    ));
                }
                frame.push(lhs.wrapping_shr(rhs as u32), at)?;
            }
            OPCode::IUShr => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                if rhs < 0 {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::NegativeShiftAmount(rhs),
                    ));
                }
                let shifted = (lhs as u32).wrapping_shr(rhs as u32);
                frame.push(shifted as i32, at)?;
            }
            OPCode::IAnd => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                frame.push(lhs & rhs, at)?;
            }
            OPCode::IOr => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                frame.push(lhs | rhs, at)?;
            }
            OPCode::IXor => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                frame.push(lhs ^ rhs, at)?;
            }
            // Stack manipulation.
            OPCode::Dup => {
                let value = frame.pop(at)?;
                frame.push(value, at)?;
                frame.push(value, at)?;
            }
            // Control flow. Comparisons against zero pop one value,
            // two-operand comparisons pop the right-hand side first.
            OPCode::IfEq => {
                if frame.pop(at)? == 0 {
                    frame.jump(operand(0)?)?;
                }
            }
            OPCode::IfNe => {
                if frame.pop(at)? != 0 {
                    frame.jump(operand(0)?)?;
                }
            }
            OPCode::IfLt => {
                if frame.pop(at)? < 0 {
                    frame.jump(operand(0)?)?;
                }
            }
            OPCode::IfGe => {
                if frame.pop(at)? >= 0 {
                    frame.jump(operand(0)?)?;
                }
            }
            OPCode::IfGt => {
                if frame.pop(at)? > 0 {
                    frame.jump(operand(0)?)?;
                }
            }
            OPCode::IfLe => {
                if frame.pop(at)? <= 0 {
                    frame.jump(operand(0)?)?;
                }
            }
            OPCode::IfICmpEq => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                if lhs == rhs {
                    frame.jump(operand(0)?)?;
                }
            }
            OPCode::IfICmpNe => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                if lhs != rhs {
                    frame.jump(operand(0)?)?;
                }
            }
            OPCode::IfICmpLt => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                if lhs < rhs {
                    frame.jump(operand(0)?)?;
                }
            }
            OPCode::IfICmpGe => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                if lhs >= rhs {
                    frame.jump(operand(0)?)?;
                }
            }
            OPCode::IfICmpGt => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                if lhs > rhs {
                    frame.jump(operand(0)?)?;
                }
            }
            OPCode::IfICmpLe => {
                let rhs = frame.pop(at)?;
                let lhs = frame.pop(at)?;
                if lhs <= rhs {
                    frame.jump(operand(0)?)?;
                }
            }
            OPCode::Goto => frame.jump(operand(0)?)?,
            // Method return.
            OPCode::IReturn | OPCode::AReturn => {
                return Ok(State::Returned(Some(frame.pop(at)?)));
            }
            OPCode::Return => return Ok(State::Returned(None)),
            // Static calls recurse with a fresh frame. Arguments pop off
            // the caller stack in reverse, the deepest of the popped
            // values lands in callee slot 0.
            OPCode::InvokeStatic => {
                let callee = operand(0)? as usize;
                let method = self.program.method(callee);
                let param_count = method.param_count();
                let max_locals = method.max_locals() as usize;
                let mut locals = vec![0; max_locals];
                for ii in (0..param_count).rev() {
                    locals[ii] = frame.pop(at)?;
                }
                if let Some(value) = self.execute(callee, locals)? {
                    frame.push(value, at)?;
                }
            }
            // Models `System.out.println(int)`, the only virtual call
            // compiled programs make in this subset. The method reference
            // is not consulted.
            OPCode::InvokeVirtual => {
                let value = frame.pop(at)?;
                println!("{value}");
            }
            // Loads `System.out` in compiled programs, nothing to do.
            OPCode::GetStatic => (),
            // Arrays live on the heap in length-prefixed layout.
            OPCode::NewArray => {
                let size = frame.pop(at)?;
                if size < 0 {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::NegativeArraySize(size),
                    ));
                }
                let mut array = vec![0; size as usize + 1];
                array[0] = size;
                let reference = self.heap.allocate(array);
                frame.push(reference, at)?;
            }
            OPCode::ArrayLength => {
                let reference = frame.pop(at)?;
                let length = self.heap.get(reference)[0];
                frame.push(length, at)?;
            }
            OPCode::IAStore => {
                let value = frame.pop(at)?;
                let index = frame.pop(at)?;
                let reference = frame.pop(at)?;
                self.heap.get_mut(reference)[index as usize + 1] = value;
            }
            OPCode::IALoad => {
                let index = frame.pop(at)?;
                let reference = frame.pop(at)?;
                let value = self.heap.get(reference)[index as usize + 1];
                frame.push(value, at)?;
            }
            OPCode::Unspecified => {
                unreachable!("unknown opcodes are rejected during fetch")
            }
        }
        Ok(State::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvm::CPInfo;
    use crate::program::{Method, MAIN_DESCRIPTOR};

    // A single-method program around the given code bytes, executed with
    // generous stack and locals bounds.
    fn run_probe(code: &[u8]) -> Result<Option<i32>, RuntimeError> {
        run_probe_with_pool(vec![CPInfo::Unspecified], code)
    }

    fn run_probe_with_pool(
        constant_pool: Vec<CPInfo>,
        code: &[u8],
    ) -> Result<Option<i32>, RuntimeError> {
        let program = Program::from_parts(
            constant_pool,
            vec![Method::new("probe", "()I", 8, 8, code.to_vec()).unwrap()],
        );
        Runtime::new(program).execute(0, vec![0; 8])
    }

    // Macro to generate unit tests for the interpreter, one per
    // hand-assembled code array.
    macro_rules! test_execute_case {
        ($name:ident, $code:expr, $expected:expr) => {
            #[test]
            fn $name() {
                assert_eq!(run_probe(&$code).unwrap(), $expected);
            }
        };
    }

    macro_rules! test_execute_fault {
        ($name:ident, $code:expr, $kind:pat) => {
            #[test]
            fn $name() {
                let err = run_probe(&$code).unwrap_err();
                assert!(matches!(err.kind(), $kind));
            }
        };
    }

    // Constants.
    test_execute_case!(iconst_m1, [0x02, 0xac], Some(-1));
    test_execute_case!(iconst_5, [0x08, 0xac], Some(5));
    test_execute_case!(bipush_min, [0x10, 0x80, 0xac], Some(-128));
    test_execute_case!(bipush_max, [0x10, 0x7f, 0xac], Some(127));
    test_execute_case!(sipush_min, [0x11, 0x80, 0x00, 0xac], Some(-32768));
    test_execute_case!(sipush_max, [0x11, 0x7f, 0xff, 0xac], Some(32767));
    test_execute_case!(nop_is_inert, [0x00, 0x06, 0xac], Some(3));

    // Arithmetic. Operand order: with `a` pushed before `b`, the result
    // is `a op b`.
    test_execute_case!(iadd, [0x06, 0x07, 0x60, 0xac], Some(7));
    test_execute_case!(isub_order, [0x10, 0x0a, 0x06, 0x64, 0xac], Some(7));
    test_execute_case!(imul, [0x10, 0x06, 0x10, 0x07, 0x68, 0xac], Some(42));
    test_execute_case!(idiv, [0x10, 0x07, 0x05, 0x6c, 0xac], Some(3));
    test_execute_case!(
        idiv_truncates_toward_zero,
        [0x10, 0xf9, 0x05, 0x6c, 0xac],
        Some(-3)
    );
    test_execute_case!(irem, [0x10, 0x07, 0x06, 0x70, 0xac], Some(1));
    test_execute_case!(ineg, [0x10, 0x2a, 0x74, 0xac], Some(-42));
    test_execute_case!(iand, [0x10, 0x0c, 0x10, 0x0a, 0x7e, 0xac], Some(8));
    test_execute_case!(ior, [0x10, 0x0c, 0x10, 0x0a, 0x80, 0xac], Some(14));
    test_execute_case!(ixor, [0x10, 0x0c, 0x10, 0x0a, 0x82, 0xac], Some(6));
    test_execute_case!(ishl, [0x04, 0x07, 0x78, 0xac], Some(16));
    test_execute_case!(ishr_sign_extends, [0x10, 0xf8, 0x04, 0x7a, 0xac], Some(-4));
    test_execute_case!(
        iushr_zero_extends,
        [0x10, 0xf8, 0x04, 0x7c, 0xac],
        Some(2_147_483_644)
    );
    test_execute_fault!(
        idiv_by_zero,
        [0x08, 0x03, 0x6c, 0xac],
        RuntimeErrorKind::DivisionByZero(OPCode::IDiv)
    );
    test_execute_fault!(
        irem_by_zero,
        [0x08, 0x03, 0x70, 0xac],
        RuntimeErrorKind::DivisionByZero(OPCode::IRem)
    );
    test_execute_fault!(
        negative_shift_amount,
        [0x04, 0x02, 0x78, 0xac],
        RuntimeErrorKind::NegativeShiftAmount(-1)
    );

    #[test]
    fn arithmetic_wraps_two_complement() {
        let pool = vec![
            CPInfo::Unspecified,
            CPInfo::ConstantInteger {
                bytes: i32::MAX as u32,
            },
            CPInfo::ConstantInteger {
                bytes: i32::MIN as u32,
            },
        ];
        // ldc MAX, iconst_1, iadd
        let sum = run_probe_with_pool(
            pool.clone(),
            &[0x12, 0x01, 0x04, 0x60, 0xac],
        );
        assert_eq!(sum.unwrap(), Some(i32::MIN));
        // ldc MIN, ineg wraps back to MIN
        let neg = run_probe_with_pool(pool.clone(), &[0x12, 0x02, 0x74, 0xac]);
        assert_eq!(neg.unwrap(), Some(i32::MIN));
        // ldc MIN, iconst_m1, idiv wraps to MIN
        let div = run_probe_with_pool(pool, &[0x12, 0x02, 0x02, 0x6c, 0xac]);
        assert_eq!(div.unwrap(), Some(i32::MIN));
    }

    #[test]
    fn ldc_rejects_non_integer_entries() {
        let pool = vec![
            CPInfo::Unspecified,
            CPInfo::ConstantUtf8 {
                bytes: "Code".to_string(),
            },
        ];
        let err = run_probe_with_pool(pool, &[0x12, 0x01, 0xac]).unwrap_err();
        assert!(matches!(
            err.kind(),
            RuntimeErrorKind::InvalidConstantPoolEntry(1)
        ));
    }

    // Local variable moves.
    test_execute_case!(
        store_load_shorthand,
        [0x10, 0x09, 0x3c, 0x1b, 0xac],
        Some(9)
    );
    test_execute_case!(
        store_load_wide_index,
        [0x10, 0x09, 0x36, 0x05, 0x15, 0x05, 0xac],
        Some(9)
    );
    test_execute_case!(
        reference_moves_share_slots,
        [0x10, 0x09, 0x3a, 0x07, 0x19, 0x07, 0xac],
        Some(9)
    );
    test_execute_case!(
        iinc_adds_signed_constant,
        [0x08, 0x3b, 0x84, 0x00, 0xfd, 0x1a, 0xac],
        Some(2)
    );
    test_execute_case!(unset_locals_read_zero, [0x1d, 0xac], Some(0));
    test_execute_fault!(
        load_out_of_range_local,
        [0x15, 0x09, 0xac],
        RuntimeErrorKind::InvalidLocalIndex(9)
    );

    // Stack manipulation.
    test_execute_case!(dup, [0x06, 0x59, 0x60, 0xac], Some(6));

    // Branches. Taken paths return 1, fall-through paths return 0.
    test_execute_case!(
        ifeq_taken,
        [0x03, 0x99, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac],
        Some(1)
    );
    test_execute_case!(
        ifeq_not_taken,
        [0x04, 0x99, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac],
        Some(0)
    );
    test_execute_case!(
        ifne_taken,
        [0x02, 0x9a, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac],
        Some(1)
    );
    test_execute_case!(
        iflt_taken,
        [0x02, 0x9b, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac],
        Some(1)
    );
    test_execute_case!(
        ifge_taken_at_zero,
        [0x03, 0x9c, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac],
        Some(1)
    );
    test_execute_case!(
        ifgt_not_taken_at_zero,
        [0x03, 0x9d, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac],
        Some(0)
    );
    test_execute_case!(
        ifle_taken,
        [0x02, 0x9e, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac],
        Some(1)
    );
    test_execute_case!(
        if_icmpeq_taken,
        [0x05, 0x05, 0x9f, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac],
        Some(1)
    );
    test_execute_case!(
        if_icmpne_not_taken,
        [0x05, 0x05, 0xa0, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac],
        Some(0)
    );
    test_execute_case!(
        if_icmplt_compares_in_push_order,
        [0x04, 0x05, 0xa1, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac],
        Some(1)
    );
    test_execute_case!(
        if_icmpge_not_taken,
        [0x04, 0x05, 0xa2, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac],
        Some(0)
    );
    test_execute_case!(
        if_icmpgt_taken,
        [0x08, 0x04, 0xa3, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac],
        Some(1)
    );
    test_execute_case!(
        if_icmple_taken,
        [0x04, 0x04, 0xa4, 0x00, 0x05, 0x03, 0xac, 0x04, 0xac],
        Some(1)
    );
    test_execute_case!(
        goto_skips_forward,
        [0xa7, 0x00, 0x04, 0x02, 0x08, 0xac],
        Some(5)
    );
    test_execute_fault!(
        branch_outside_code_array,
        [0x03, 0x99, 0x00, 0x50],
        RuntimeErrorKind::InvalidBranchTarget(80)
    );

    // Sum of 1..=10 with a backward goto, the canonical counting loop.
    test_execute_case!(
        loop_sums_one_to_ten,
        [
            0x03, 0x3b, 0x04, 0x3c, 0x1b, 0x10, 0x0a, 0xa3, 0x00, 0x0d, 0x1a,
            0x1b, 0x60, 0x3b, 0x84, 0x01, 0x01, 0xa7, 0xff, 0xf3, 0x1a, 0xac
        ],
        Some(55)
    );

    #[test]
    fn branch_offsets_reach_sixteen_bit_extremes() {
        // Forward: ifeq at pc 1 with offset 32764 lands on an iconst_5.
        let mut code = vec![0x00; 32767];
        code[0] = 0x03;
        code[1] = 0x99;
        code[2] = 0x7f;
        code[3] = 0xfc;
        code[32765] = 0x08;
        code[32766] = 0xac;
        assert_eq!(run_probe(&code).unwrap(), Some(5));

        // Backward: a goto at pc 32000 rewinds 31997 bytes to pc 3.
        let mut code = vec![0x00; 32003];
        code[0] = 0xa7;
        code[1] = 0x7d;
        code[2] = 0x00;
        code[3] = 0x08;
        code[4] = 0xac;
        code[32000] = 0xa7;
        code[32001] = 0x83;
        code[32002] = 0x03;
        assert_eq!(run_probe(&code).unwrap(), Some(5));
    }

    // Returns and implicit fall-through.
    test_execute_case!(empty_body_returns_void, [], None);
    test_execute_case!(fall_through_returns_void, [0x00], None);
    test_execute_case!(return_is_void, [0x08, 0xb1], None);

    // Stack discipline faults.
    test_execute_fault!(
        underflow_on_empty_stack,
        [0x60, 0xac],
        RuntimeErrorKind::StackUnderflow(OPCode::IAdd)
    );
    test_execute_fault!(
        unknown_opcode_is_fatal,
        [0x09, 0xac],
        RuntimeErrorKind::UnknownOpcode(0x09)
    );
    test_execute_fault!(
        truncated_immediate_is_fatal,
        [0x10],
        RuntimeErrorKind::UnexpectedEndOfCode
    );

    #[test]
    fn overflow_past_declared_max_stack() {
        let program = Program::from_parts(
            vec![CPInfo::Unspecified],
            vec![Method::new("probe", "()I", 1, 1, vec![0x04, 0x04, 0x60, 0xac])
                .unwrap()],
        );
        let err = Runtime::new(program).execute(0, vec![0]).unwrap_err();
        assert!(matches!(
            err.kind(),
            RuntimeErrorKind::StackOverflow(OPCode::Iconst1)
        ));
    }

    // Output instructions: getstatic is a no-op, invokevirtual pops the
    // printed value and nothing else.
    test_execute_case!(
        println_pops_one_value,
        [0xb2, 0x00, 0x01, 0x10, 0x2a, 0xb6, 0x00, 0x02, 0x06, 0xac],
        Some(3)
    );

    // Static calls.
    fn call_pool(name: &str, descriptor: &str) -> Vec<CPInfo> {
        vec![
            CPInfo::Unspecified,
            CPInfo::ConstantMethodRef {
                class_index: 2,
                name_and_type_index: 3,
            },
            CPInfo::ConstantClass { name_index: 6 },
            CPInfo::ConstantNameAndType {
                name_index: 4,
                descriptor_index: 5,
            },
            CPInfo::ConstantUtf8 {
                bytes: name.to_string(),
            },
            CPInfo::ConstantUtf8 {
                bytes: descriptor.to_string(),
            },
            CPInfo::ConstantUtf8 {
                bytes: "Scratch".to_string(),
            },
        ]
    }

    fn run_with_callee(
        caller_code: &[u8],
        name: &str,
        descriptor: &str,
        callee_code: &[u8],
    ) -> Result<Option<i32>, RuntimeError> {
        let program = Program::from_parts(
            call_pool(name, descriptor),
            vec![
                Method::new("probe", "()I", 8, 8, caller_code.to_vec())
                    .unwrap(),
                Method::new(name, descriptor, 8, 8, callee_code.to_vec())
                    .unwrap(),
            ],
        );
        Runtime::new(program).execute(0, vec![0; 8])
    }

    #[test]
    fn invokestatic_two_parameters() {
        // probe: mul(6, 7); mul: locals[0] * locals[1]
        let result = run_with_callee(
            &[0x10, 0x06, 0x10, 0x07, 0xb8, 0x00, 0x01, 0xac],
            "mul",
            "(II)I",
            &[0x1a, 0x1b, 0x68, 0xac],
        );
        assert_eq!(result.unwrap(), Some(42));
    }

    #[test]
    fn invokestatic_marshalls_arguments_in_push_order() {
        // sub(10, 3) must compute locals[0] - locals[1] = 7, proving the
        // first pushed argument lands in slot 0.
        let result = run_with_callee(
            &[0x10, 0x0a, 0x06, 0xb8, 0x00, 0x01, 0xac],
            "sub",
            "(II)I",
            &[0x1a, 0x1b, 0x64, 0xac],
        );
        assert_eq!(result.unwrap(), Some(7));
    }

    #[test]
    fn invokestatic_void_callee_leaves_stack_alone() {
        let result = run_with_callee(
            &[0x05, 0xb8, 0x00, 0x01, 0xac],
            "noop",
            "()V",
            &[0xb1],
        );
        assert_eq!(result.unwrap(), Some(2));
    }

    #[test]
    fn invokestatic_recursion() {
        // probe: fact(5); fact: n == 0 ? 1 : n * fact(n - 1)
        let fact = [
            0x1a, 0x99, 0x00, 0x0c, 0x1a, 0x1a, 0x04, 0x64, 0xb8, 0x00, 0x01,
            0x68, 0xac, 0x04, 0xac,
        ];
        let result = run_with_callee(
            &[0x10, 0x05, 0xb8, 0x00, 0x01, 0xac],
            "fact",
            "(I)I",
            &fact,
        );
        assert_eq!(result.unwrap(), Some(120));
    }

    #[test]
    fn invokestatic_unresolved_method_ref() {
        let err = run_probe(&[0xb8, 0x00, 0x05, 0xac]).unwrap_err();
        assert!(matches!(
            err.kind(),
            RuntimeErrorKind::UnresolvedMethodRef(5)
        ));
    }

    // Arrays.
    test_execute_case!(
        newarray_then_arraylength,
        [0x10, 0x04, 0xbc, 0x0a, 0xbe, 0xac],
        Some(4)
    );
    test_execute_case!(
        array_element_round_trip,
        [
            0x10, 0x04, 0xbc, 0x0a, 0x4b, 0x2a, 0x05, 0x10, 0x1e, 0x4f, 0x2a,
            0x05, 0x2e, 0xac
        ],
        Some(30)
    );
    test_execute_case!(
        fresh_array_elements_are_zero,
        [0x06, 0xbc, 0x0a, 0x4b, 0x2a, 0x04, 0x2e, 0xac],
        Some(0)
    );
    test_execute_fault!(
        newarray_negative_size,
        [0x02, 0xbc, 0x0a, 0xac],
        RuntimeErrorKind::NegativeArraySize(-1)
    );

    #[test]
    fn areturn_yields_the_heap_reference() {
        let program = Program::from_parts(
            vec![CPInfo::Unspecified],
            vec![Method::new(
                "probe",
                "()[I",
                8,
                8,
                // newarray 3, dup, 0, 7, iastore, areturn
                vec![
                    0x06, 0xbc, 0x0a, 0x59, 0x03, 0x10, 0x07, 0x4f, 0xb0,
                ],
            )
            .unwrap()],
        );
        let mut runtime = Runtime::new(program);
        let reference = runtime.execute(0, vec![0; 8]).unwrap().unwrap();
        assert_eq!(reference, 0);
        assert_eq!(runtime.heap().get(reference), &[3, 7, 0, 0]);
    }

    // Entry point contract.
    #[test]
    fn run_requires_a_main_method() {
        let program = Program::from_parts(vec![CPInfo::Unspecified], vec![]);
        let err = Runtime::new(program).run().unwrap_err();
        assert!(matches!(err.kind(), RuntimeErrorKind::MissingEntryPoint));
    }

    #[test]
    fn run_rejects_main_returning_a_value() {
        let program = Program::from_parts(
            vec![CPInfo::Unspecified],
            vec![Method::new(
                "main",
                MAIN_DESCRIPTOR,
                8,
                8,
                vec![0x04, 0xac],
            )
            .unwrap()],
        );
        let err = Runtime::new(program).run().unwrap_err();
        assert!(matches!(
            err.kind(),
            RuntimeErrorKind::EntryPointReturnedValue(1)
        ));
    }

    #[test]
    fn run_executes_a_void_main() {
        let program = Program::from_parts(
            vec![CPInfo::Unspecified],
            vec![Method::new(
                "main",
                MAIN_DESCRIPTOR,
                8,
                8,
                vec![0x05, 0x3c, 0xb1],
            )
            .unwrap()],
        );
        assert!(Runtime::new(program).run().is_ok());
    }
}
