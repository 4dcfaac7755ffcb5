use std::{error, fmt};

use tracing::trace;

use crate::code::CodeBuffer;
use crate::dso::Dso;
use crate::emit::{Emitter, tabs};
use crate::opcode::{CallType, Opcode};

/// The pseudo-stacks an underflow can be detected on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stack {
    String,
    Uint,
    Float,
    BooleanChain,
    Frame,
    Object,
}

/// Decompilation errors. The driver reports the instruction pointer and the
/// symbolic opcode of the failure site.
#[derive(Debug, Clone)]
pub enum Error {
    UnknownOpcode { value: u32, ip: usize },
    Unimplemented { opcode: Opcode, ip: usize },
    BackwardJump { ip: usize, target: usize },
    JumpOutOfRange { ip: usize, target: usize },
    Truncated { ip: usize },
    StackUnderflow { stack: Stack, ip: usize },
    UnknownCallType { value: u32, ip: usize },
    BadFloatIndex { index: u32, ip: usize },
    CursorUnset { ip: usize },
    Other(&'static str),
    Sink(fmt::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { value, ip } => {
                write!(f, "value {value:#x} at ip={ip} does not translate to an opcode")
            }
            Self::Unimplemented { opcode, ip } => {
                write!(f, "{opcode:?} not implemented, stopped at ip={ip}")
            }
            Self::BackwardJump { ip, target } => {
                write!(f, "unexpected backward jump to {target} at ip={ip}")
            }
            Self::JumpOutOfRange { ip, target } => {
                write!(f, "jump to {target} at ip={ip} leaves the code")
            }
            Self::Truncated { ip } => {
                write!(f, "code ends inside the operands of the opcode at ip={ip}")
            }
            Self::StackUnderflow { stack, ip } => {
                write!(f, "{stack:?} stack underflow at ip={ip}")
            }
            Self::UnknownCallType { value, ip } => {
                write!(f, "unknown call type {value} at ip={ip}")
            }
            Self::BadFloatIndex { index, ip } => {
                write!(f, "float constant {index} at ip={ip} is outside its table")
            }
            Self::CursorUnset { ip } => {
                write!(f, "variable or field access before any cursor was set at ip={ip}")
            }
            Self::Other(message) => f.write_str(message),
            Self::Sink(err) => err.fmt(f),
        }
    }
}

impl error::Error for Error {}

impl From<fmt::Error> for Error {
    fn from(err: fmt::Error) -> Self {
        Self::Sink(err)
    }
}

/// Decompile a parsed module, writing indented script text to `sink`.
pub fn decompile<W: fmt::Write>(dso: &Dso, sink: W) -> Result<(), Error> {
    Decompiler::new(dso, CodeBuffer::new(dso.code.clone()), sink).run()?;
    Ok(())
}

/// Convenience wrapper returning the script as one string.
pub fn decompile_to_string(dso: &Dso) -> Result<String, Error> {
    let mut out = String::new();
    decompile(dso, &mut out)?;
    Ok(out)
}

/// Stack contents left over by a run; a ternary probe decides on these.
struct Stacks {
    string: Vec<String>,
    uint: Vec<String>,
    float: Vec<String>,
}

struct Decompiler<'dso, W> {
    dso: &'dso Dso,
    code: CodeBuffer,
    out: Emitter<W>,
    ip: usize,
    /// Subtracted from absolute jump operands; non-zero only in probes.
    offset: usize,
    in_function: bool,
    string_stack: Vec<String>,
    uint_stack: Vec<String>,
    float_stack: Vec<String>,
    /// Pending `a || ` / `a && ` fragments; no counterpart in the VM.
    chain_stack: Vec<String>,
    frames: Vec<Vec<String>>,
    /// In-progress object literals, dialect 45 and later.
    objects: Vec<String>,
    current_variable: Option<String>,
    /// `None` while an object literal is being built.
    current_object: Option<String>,
    current_field: Option<String>,
    history: [Opcode; 5],
}

impl<'dso, W: fmt::Write> Decompiler<'dso, W> {
    fn new(dso: &'dso Dso, code: CodeBuffer, sink: W) -> Self {
        Self {
            dso,
            code,
            out: Emitter::new(sink),
            ip: 0,
            offset: 0,
            in_function: false,
            string_stack: Vec::new(),
            uint_stack: Vec::new(),
            float_stack: Vec::new(),
            chain_stack: Vec::new(),
            frames: Vec::new(),
            objects: Vec::new(),
            current_variable: None,
            current_object: None,
            current_field: None,
            history: [Opcode::Invalid; 5],
        }
    }

    fn run(mut self) -> Result<Stacks, Error> {
        let ste = self.dso.ste_size();
        while self.ip < self.code.len() {
            let value = self.code.get(self.ip).ok_or(Error::Truncated { ip: self.ip })?;
            let opcode = Opcode::for_version(self.dso.version, value)
                .ok_or(Error::UnknownOpcode { value, ip: self.ip })?;
            trace!(ip = self.ip, value, ?opcode, "dispatch");
            self.ip += 1;

            match opcode {
                Opcode::DocBlockStr => {
                    let text = self.dso.string(self.arg(0)?, self.in_function);
                    self.out.line(&format!("///{text}"))?;
                    self.ip += 1;
                }
                Opcode::LoadImmedStr | Opcode::TagToStr => {
                    let text = self.dso.string(self.arg(0)?, self.in_function);
                    self.ip += 1;
                    // Floats may hide in string literals; leave those bare.
                    let literal = if is_number(&text) {
                        text
                    } else if opcode == Opcode::TagToStr {
                        // Tagged strings are encased in single quotes.
                        format!("'{text}'")
                    } else {
                        format!("\"{}\"", text.replace('"', "\\\""))
                    };
                    self.string_stack.push(literal);
                }
                Opcode::LoadImmedIdent => {
                    // Identifiers always live in the global pool.
                    let text = self.dso.string(self.arg(0)?, false);
                    self.string_stack.push(text);
                    self.ip += ste;
                }
                Opcode::LoadImmedUint => {
                    let value = self.arg(0)?;
                    self.uint_stack.push(value.to_string());
                    self.ip += 1;
                }
                Opcode::LoadImmedFlt => {
                    let index = self.arg(0)?;
                    self.ip += 1;
                    let value = self
                        .dso
                        .float(index, self.in_function)
                        .ok_or(Error::BadFloatIndex { index, ip: self.ip })?;
                    self.float_stack.push(value.to_string());
                }

                Opcode::SetCurVar | Opcode::SetCurVarCreate => {
                    self.current_variable = Some(self.dso.string(self.arg(0)?, false));
                    self.ip += ste;
                }
                Opcode::SetCurVarArray | Opcode::SetCurVarArrayCreate => {
                    self.current_variable = Some(self.pop_str()?);
                }
                Opcode::LoadVarStr => {
                    let name = self.variable()?.to_owned();
                    self.string_stack.push(name);
                }
                Opcode::LoadVarFlt => {
                    let name = self.variable()?.to_owned();
                    self.float_stack.push(name);
                }
                Opcode::LoadVarUint => {
                    let name = self.variable()?.to_owned();
                    self.uint_stack.push(name);
                }
                Opcode::SaveVarStr => {
                    let line = format!("{} = {};", self.variable()?, self.peek_str()?);
                    self.out.line(&line)?;
                }
                Opcode::SaveVarUint => {
                    let line = format!("{} = {};", self.variable()?, self.peek_uint()?);
                    self.out.line(&line)?;
                }
                Opcode::SaveVarFlt => {
                    let line = format!("{} = {};", self.variable()?, self.peek_flt()?);
                    self.out.line(&line)?;
                }

                Opcode::SetCurObject => {
                    self.current_object = Some(self.pop_str()?);
                }
                Opcode::SetCurObjectNew => {
                    self.current_object = None;
                }
                Opcode::SetCurObjectInternal => {
                    self.ip += 1;
                    let object = self.pop_str()?;
                    self.uint_stack.push(object.clone());
                    self.current_object = Some(object);
                }
                Opcode::SetCurField => {
                    self.current_field = Some(self.dso.string(self.arg(0)?, false));
                    self.ip += ste;
                }
                Opcode::SetCurFieldArray => {}
                Opcode::SetCurFieldType => {
                    self.ip += 1;
                }
                Opcode::LoadFieldStr => {
                    let text = format!("{}.{}", self.object()?, self.field()?);
                    self.string_stack.push(text);
                }
                Opcode::LoadFieldFlt => {
                    let text = format!("{}.{}", self.object()?, self.field()?);
                    self.float_stack.push(text);
                }
                Opcode::LoadFieldUint => {
                    let text = format!("{}.{}", self.object()?, self.field()?);
                    self.uint_stack.push(text);
                }
                Opcode::SaveFieldStr => {
                    // Old compilers sometimes leave the value slot empty.
                    if self.dso.version <= 36 && self.string_stack.is_empty() {
                        self.string_stack.push("\"\"".to_string());
                    }
                    if self.current_object.is_none() {
                        let value = self.peek_str()?.to_owned();
                        self.append_literal_field(&value)?;
                    } else {
                        let line =
                            format!("{}.{} = {};", self.object()?, self.field()?, self.peek_str()?);
                        self.out.line(&line)?;
                    }
                }
                Opcode::SaveFieldFlt => {
                    if self.current_object.is_none() {
                        let value = self.pop_flt()?;
                        self.append_literal_field(&value)?;
                    } else {
                        let line =
                            format!("{}.{} = {};", self.object()?, self.field()?, self.peek_flt()?);
                        self.out.line(&line)?;
                    }
                }
                Opcode::SaveFieldUint => {
                    if self.current_object.is_none() {
                        let value = self.peek_uint()?.to_owned();
                        self.append_literal_field(&value)?;
                    } else {
                        let line = format!(
                            "{}.{} = {};",
                            self.object()?,
                            self.field()?,
                            self.peek_uint()?
                        );
                        self.out.line(&line)?;
                    }
                }

                Opcode::StrToNone => {
                    if matches!(self.history[0], Opcode::CallFunc | Opcode::CallFuncResolve) {
                        // An ignored return value: the call is a statement of
                        // its own and will never be assigned to anything.
                        let call = self.pop_str()?;
                        self.out.line(&format!("{call};"))?;
                    } else {
                        // Tolerate an empty stack; OP_TERMINATE_REWIND_STR
                        // sequences are known to leave it short.
                        let _ = self.string_stack.pop();
                    }
                }
                Opcode::StrToFlt => {
                    let value = self.pop_str()?;
                    self.float_stack.push(value);
                }
                Opcode::StrToUint => {
                    let value = self.pop_str()?;
                    self.uint_stack.push(value);
                }
                Opcode::FltToStr => {
                    let value = self.pop_flt()?;
                    self.string_stack.push(value);
                }
                Opcode::FltToUint => {
                    let value = self.pop_flt()?;
                    self.uint_stack.push(value);
                }
                Opcode::FltToNone => {
                    self.pop_flt()?;
                }
                Opcode::UintToStr => {
                    let value = self.pop_uint()?;
                    self.string_stack.push(value);
                }
                Opcode::UintToFlt => {
                    let value = self.pop_uint()?;
                    self.float_stack.push(value);
                }
                Opcode::UintToNone => {
                    let completes_object = if self.dso.version < 45 {
                        Opcode::EndObject
                    } else {
                        Opcode::FinishObject
                    };
                    let top = self.pop_uint()?;
                    if self.history[0] == completes_object {
                        // The accumulated object literal becomes a statement.
                        self.out.line(&top)?;
                    }
                }

                Opcode::PushFrame => {
                    self.frames.push(Vec::new());
                }
                Opcode::Push => {
                    // Old compilers do not always open a frame first.
                    if self.dso.version <= 36 && self.frames.is_empty() {
                        self.frames.push(Vec::new());
                    }
                    let value = self.pop_str()?;
                    self.frames
                        .last_mut()
                        .ok_or(Error::StackUnderflow { stack: Stack::Frame, ip: self.ip })?
                        .push(value);
                }
                Opcode::CallFunc | Opcode::CallFuncResolve => {
                    let name = self.dso.string(self.arg(0)?, false);
                    let namespace_offset = self.arg(ste)?;
                    let namespace = if namespace_offset != 0 {
                        self.dso.string(namespace_offset, false)
                    } else {
                        String::new()
                    };
                    let raw_type = self.arg(2 * ste)?;
                    let call_type = CallType::try_from(raw_type)
                        .map_err(|_| Error::UnknownCallType { value: raw_type, ip: self.ip })?;
                    let mut arguments = self
                        .frames
                        .pop()
                        .ok_or(Error::StackUnderflow { stack: Stack::Frame, ip: self.ip })?;
                    let call = render_call(&name, &namespace, &mut arguments, call_type)
                        .ok_or(Error::StackUnderflow { stack: Stack::Frame, ip: self.ip })?;
                    self.string_stack.push(call);
                    self.ip += 1 + 2 * ste;
                }

                Opcode::FuncDecl => {
                    let name = self.dso.string(self.arg(0)?, false);
                    let namespace_offset = self.arg(ste)?;
                    let namespace = if namespace_offset != 0 {
                        self.dso.string(namespace_offset, false)
                    } else {
                        String::new()
                    };
                    let _package = self.arg(2 * ste)?;
                    let _has_body = self.arg(3 * ste)?;
                    let end_ip = self.arg(3 * ste + 1)? as usize;
                    // A function may have several exit points; the marker, not
                    // OP_RETURN, closes the brace.
                    self.code.insert(end_ip, Opcode::MetaEndFunc as u32);
                    let argc = self.arg(3 * ste + 2)? as usize;
                    let mut arguments = Vec::with_capacity(argc);
                    for i in 0..argc {
                        arguments.push(self.dso.string(self.arg(3 * ste + 3 + ste * i)?, false));
                    }
                    let header = render_call(&name, &namespace, &mut arguments, CallType::Function)
                        .ok_or(Error::StackUnderflow { stack: Stack::Frame, ip: self.ip })?;
                    self.out.line(&format!("function {header}"))?;
                    self.out.line("{")?;
                    self.out.indent();
                    self.ip += 3 + 3 * ste + ste * argc;
                    self.in_function = true;
                }
                Opcode::Return => {
                    if let Some(value) = self.string_stack.pop() {
                        self.out.line(&format!("return {value};"))?;
                    } else if self.ip != self.code.len()
                        && self.code.get(self.ip) != Some(Opcode::MetaEndFunc as u32)
                    {
                        // Omitted when the function or the script ends here.
                        self.out.line("return;")?;
                    }
                }
                Opcode::ReturnVoid => {
                    if self.ip != self.code.len()
                        && self.code.get(self.ip) != Some(Opcode::MetaEndFunc as u32)
                    {
                        self.out.line("return;")?;
                    }
                }
                Opcode::MetaEndFunc => {
                    if self.in_function {
                        self.in_function = false;
                        self.out.outdent();
                        self.out.line("}")?;
                        self.out.blank()?;
                    }
                    self.code.delete(self.ip - 1);
                    self.ip -= 1;
                }

                Opcode::CreateObject => {
                    let parent = self.dso.string(self.arg(0)?, false);
                    let frame = self
                        .frames
                        .pop()
                        .ok_or(Error::StackUnderflow { stack: Stack::Frame, ip: self.ip })?;
                    let [class, object_name, ..] = frame.as_slice() else {
                        return Err(Error::StackUnderflow { stack: Stack::Frame, ip: self.ip });
                    };
                    let name_argument = if object_name == "\"\"" {
                        ""
                    } else {
                        object_name.as_str()
                    };
                    let constructor = if parent.is_empty() {
                        name_argument.to_string()
                    } else {
                        format!("{name_argument} : {parent}")
                    };
                    let mut literal = format!("new {class}({constructor})\n");
                    literal.push_str(&tabs(self.out.level()));
                    literal.push_str("{\n");
                    if self.dso.version < 45 {
                        // The zero pushed for the future handle carries the
                        // literal text from here on.
                        let placeholder = self.pop_uint()?;
                        if placeholder != "0" {
                            return Err(Error::Other("object handle placeholder missing"));
                        }
                        self.uint_stack.push(literal);
                    } else {
                        self.objects.push(literal);
                    }
                    self.out.indent();
                    // Trailer: parent, isDataBlock, isInternal, isSingleton,
                    // lineNumber, failjump; no lineNumber slot before 45.
                    self.ip += 5 + ste;
                    if self.dso.version < 45 {
                        self.ip -= 1;
                    }
                }
                Opcode::AddObject => {
                    if self.dso.version >= 45 {
                        let root = self.arg(0)? != 0;
                        if root {
                            let placeholder = self.pop_uint()?;
                            if placeholder != "0" {
                                return Err(Error::Other("object handle placeholder missing"));
                            }
                        }
                        let literal = self
                            .objects
                            .pop()
                            .ok_or(Error::StackUnderflow { stack: Stack::Object, ip: self.ip })?;
                        self.uint_stack.push(literal);
                    }
                    self.ip += 1;
                }
                Opcode::EndObject => {
                    self.out.outdent();
                    let mut literal = self.pop_uint()?;
                    let empty_body = format!("\n{}{{\n", tabs(self.out.level()));
                    if literal.ends_with(&empty_body) {
                        // Empty declaration: omit the body.
                        literal.truncate(literal.len() - empty_body.len());
                    } else {
                        literal.push_str(&tabs(self.out.level()));
                        literal.push('}');
                    }
                    if self.dso.version < 45 {
                        self.uint_stack.push(literal);
                    } else {
                        let root = self.arg(0)? != 0;
                        if root {
                            self.uint_stack.push(literal);
                        } else {
                            // A nested literal folds into its enclosing one.
                            let enclosing = self.pop_uint()?;
                            self.uint_stack.push(format!(
                                "{enclosing}{}{literal}\n",
                                tabs(self.out.level())
                            ));
                        }
                    }
                    self.ip += 1;
                }
                Opcode::FinishObject => {}

                Opcode::AdvanceStr | Opcode::AdvanceStrNul => {}
                Opcode::AdvanceStrAppendChar => {
                    let value = self.arg(0)?;
                    let character = char::from_u32(value)
                        .ok_or(Error::Other("appended character is not a scalar value"))?;
                    self.string_stack
                        .last_mut()
                        .ok_or(Error::StackUnderflow { stack: Stack::String, ip: self.ip })?
                        .push(character);
                    self.ip += 1;
                }
                Opcode::AdvanceStrComma => {
                    self.string_stack
                        .last_mut()
                        .ok_or(Error::StackUnderflow { stack: Stack::String, ip: self.ip })?
                        .push(',');
                }
                Opcode::RewindStr => {
                    let next = self
                        .code
                        .get(self.ip)
                        .and_then(|v| Opcode::for_version(self.dso.version, v));
                    if matches!(
                        next,
                        Some(Opcode::SetCurVarArray | Opcode::SetCurVarArrayCreate)
                    ) {
                        // The rewind feeds an array-index setter.
                        let index = self.pop_str()?;
                        let base = self.pop_str()?;
                        self.string_stack.push(format!("{base}[{index}]"));
                    } else {
                        let right = self.pop_str()?;
                        let mut left = self.pop_str()?;
                        match left.chars().last() {
                            Some(separator @ ('\t' | '\n' | ' ')) => {
                                left.pop();
                                let keyword = separator_keyword(separator);
                                self.string_stack.push(format!("{left} {keyword} {right}"));
                            }
                            // A trailing comma is matrix-style indexing.
                            Some(',') => self.string_stack.push(format!("{left}{right}")),
                            _ => self.string_stack.push(format!("{left} @ {right}")),
                        }
                    }
                }
                Opcode::TerminateRewindStr => {}
                Opcode::CompareStr => {
                    let right = self.pop_str()?;
                    let left = self.pop_str()?;
                    self.uint_stack.push(format!("{left} $= {right}"));
                }

                Opcode::CmpEq
                | Opcode::CmpGr
                | Opcode::CmpGe
                | Opcode::CmpLt
                | Opcode::CmpLe
                | Opcode::CmpNe => {
                    let left = self.pop_flt()?;
                    let right = self.pop_flt()?;
                    self.uint_stack
                        .push(format!("{left} {} {right}", comparison_operator(opcode)));
                }
                Opcode::Not => {
                    let operand = self.pop_uint()?;
                    self.uint_stack.push(negate_fragment(&operand));
                }
                Opcode::NotF => {
                    let operand = self.pop_flt()?;
                    let negated = if let Ok(value) = operand.parse::<f64>() {
                        // The VM folded the operand to a plain number.
                        if value == 0.0 { "true" } else { "false" }.to_string()
                    } else if let Some(plain) = operand.strip_prefix('!') {
                        plain.to_string()
                    } else {
                        format!("!{operand}")
                    };
                    self.uint_stack.push(negated);
                }
                Opcode::Add => {
                    let left = self.pop_flt()?;
                    let right = self.pop_flt()?;
                    self.float_stack.push(format!("{left} + {right}"));
                }
                Opcode::Sub => {
                    let left = self.pop_flt()?;
                    let right = self.pop_flt()?;
                    self.float_stack.push(format!("{left} - {right}"));
                }
                Opcode::Mul => {
                    let left = wrap_sum(self.pop_flt()?);
                    let right = self.pop_flt()?;
                    self.float_stack.push(format!("{left} * {right}"));
                }
                Opcode::Div => {
                    let left = wrap_sum(self.pop_flt()?);
                    let right = self.pop_flt()?;
                    self.float_stack.push(format!("{left} / {right}"));
                }
                Opcode::Neg => {
                    let operand = self.pop_flt()?;
                    let negated = if let Ok(value) = operand.parse::<f64>() {
                        (-value).to_string()
                    } else if let Some(positive) = operand.strip_prefix('-') {
                        positive.to_string()
                    } else if operand.contains(' ') {
                        format!("-({operand})")
                    } else {
                        format!("-{operand}")
                    };
                    self.float_stack.push(negated);
                }
                Opcode::Mod => {
                    let right = self.pop_uint()?;
                    let left = self.pop_uint()?;
                    self.uint_stack.push(format!("{left} % {right}"));
                }
                Opcode::BitAnd | Opcode::BitOr | Opcode::Shr | Opcode::Shl | Opcode::And
                | Opcode::Or => {
                    let right = self.pop_uint()?;
                    let left = self.pop_uint()?;
                    let operator = match opcode {
                        Opcode::BitAnd => "&",
                        Opcode::BitOr => "|",
                        Opcode::Shr => ">>",
                        Opcode::Shl => "<<",
                        Opcode::And => "&&",
                        _ => "||",
                    };
                    self.uint_stack.push(format!("{left} {operator} {right}"));
                }

                Opcode::Jmp => {
                    let target = self.jump_target(self.arg(0)?)?;
                    if self
                        .opcode_before(target, 2)
                        .is_some_and(Opcode::closes_loop)
                    {
                        // Jumping past the end of a loop.
                        self.out.line("break;")?;
                    } else if self.opcode_at(self.ip + 1) == Some(Opcode::IterEnd) {
                        // The implicit jump that closes a foreach body.
                    } else {
                        self.out.line("continue;")?;
                    }
                    self.ip += 1;
                }
                Opcode::JmpIfNp | Opcode::JmpIfNotNp => {
                    let joiner = if opcode == Opcode::JmpIfNp { " || " } else { " && " };
                    let condition = self.pop_uint()?;
                    self.chain_stack.push(format!("{condition}{joiner}"));
                    let target = self.jump_target(self.arg(0)?)?;
                    self.code.insert(target, Opcode::MetaEndBinaryOp as u32);
                    self.ip += 1;
                }
                Opcode::MetaEndBinaryOp => {
                    self.code.delete(self.ip - 1);
                    self.ip -= 1;
                    let pending = self.chain_stack.pop().ok_or(Error::StackUnderflow {
                        stack: Stack::BooleanChain,
                        ip: self.ip,
                    })?;
                    let mut right = self.pop_uint()?;
                    if right.contains("&&") || right.contains("||") {
                        right = format!("({right})");
                    }
                    self.uint_stack.push(format!("{pending}{right}"));
                }
                Opcode::JmpIfNot | Opcode::JmpIffNot => {
                    let target = self.jump_target(self.arg(0)?)?;
                    if target < self.ip {
                        return Err(Error::BackwardJump { ip: self.ip, target });
                    }
                    if target == self.ip + 1 {
                        // Empty body; drop the condition and move on.
                        self.ip += 1;
                        self.pop_condition(opcode)?;
                        continue;
                    }
                    let before = self.opcode_before(target, 2);
                    if before == Some(Opcode::Jmp) {
                        // The branch ends with a jump past what follows:
                        // either an if/else statement or a ternary.
                        if self.try_ternary(opcode, target)? {
                            continue;
                        }
                        let else_raw = self
                            .code
                            .get(target - 1)
                            .ok_or(Error::JumpOutOfRange { ip: self.ip, target })?;
                        let else_target = self.jump_target(else_raw)?;
                        if !self
                            .opcode_before(else_target, 2)
                            .is_some_and(Opcode::closes_loop)
                        {
                            // The trailing jump skips an else branch.
                            let condition = self.pop_condition(opcode)?;
                            self.out.line(&format!("if ({condition})"))?;
                            self.out.line("{")?;
                            self.code.rewrite(target - 2, Opcode::MetaElse as u32);
                            self.code.insert(else_target, Opcode::MetaEndIf as u32);
                            self.ip += 1;
                            self.out.indent();
                            continue;
                        }
                        // The trailing jump leaves an enclosing loop: it is a
                        // break statement inside a plain if body.
                    } else if matches!(
                        before,
                        Some(Opcode::JmpIfNot | Opcode::JmpIf | Opcode::JmpIff)
                    ) && self
                        .code
                        .get(target - 1)
                        .and_then(|raw| (raw as usize).checked_sub(self.offset))
                        == Some(self.ip + 1)
                    {
                        // The conditional jump before the target re-enters the
                        // body: this is the back edge of a while loop.
                        let condition = self.pop_condition(opcode)?;
                        self.out.line(&format!("while ({condition})"))?;
                        self.out.line("{")?;
                        let marker = if before == Some(Opcode::JmpIff) {
                            Opcode::MetaEndWhileFlt
                        } else {
                            Opcode::MetaEndWhile
                        };
                        self.code.rewrite(target - 2, marker as u32);
                        self.ip += 1;
                        self.out.indent();
                        continue;
                    }
                    // Execution continues at the target: a plain if.
                    let condition = self.pop_condition(opcode)?;
                    self.out.line(&format!("if ({condition})"))?;
                    self.out.line("{")?;
                    self.code.insert(target, Opcode::MetaEndIf as u32);
                    self.ip += 1;
                    self.out.indent();
                }

                Opcode::MetaElse => {
                    self.out.outdent();
                    self.out.line("}")?;
                    self.out.line("else")?;
                    self.out.line("{")?;
                    self.out.indent();
                    // The marker replaced a jump; skip its operand.
                    self.ip += 1;
                }
                Opcode::MetaEndIf => {
                    self.out.outdent();
                    self.out.line("}")?;
                    self.code.delete(self.ip - 1);
                    self.ip -= 1;
                }
                Opcode::MetaEndWhile => {
                    self.out.outdent();
                    self.out.line("}")?;
                    self.ip += 1;
                    // The re-evaluated loop condition needs cleaning.
                    self.pop_uint()?;
                }
                Opcode::MetaEndWhileFlt => {
                    self.out.outdent();
                    self.out.line("}")?;
                    self.ip += 1;
                    self.pop_flt()?;
                }

                Opcode::IterBegin | Opcode::IterBeginStr => {
                    let variable = self.dso.string(self.arg(0)?, false);
                    let collection = self.pop_str()?;
                    let keyword = if opcode == Opcode::IterBeginStr {
                        "foreach$"
                    } else {
                        "foreach"
                    };
                    self.out
                        .line(&format!("{keyword} ({variable} in {collection})"))?;
                    self.out.line("{")?;
                    self.ip += 3;
                    self.out.indent();
                }
                Opcode::Iter => {
                    self.ip += 1;
                }
                Opcode::IterEnd => {
                    self.out.outdent();
                    self.out.line("}")?;
                }

                Opcode::Assert => {
                    let message = self.dso.string(self.arg(0)?, self.in_function);
                    self.out.line(&format!("assert(\"{message}\");"))?;
                    self.ip += 1;
                }
                Opcode::Break => {
                    // Breakpoints have no textual counterpart.
                }

                Opcode::Xor
                | Opcode::OnesComplement
                | Opcode::JmpIf
                | Opcode::JmpIff
                | Opcode::Invalid => {
                    return Err(Error::Unimplemented { opcode, ip: self.ip });
                }
            }

            self.history.rotate_right(1);
            self.history[0] = opcode;
        }

        Ok(Stacks {
            string: self.string_stack,
            uint: self.uint_stack,
            float: self.float_stack,
        })
    }

    /// Decide whether the `JMPIFNOT … JMP` shape at hand is a ternary: run a
    /// throwaway decompilation of the guarded region and see whether it leaves
    /// exactly two values on one typed stack. On success the combined
    /// fragment is pushed and the instruction pointer skips the construction.
    fn try_ternary(&mut self, opcode: Opcode, target: usize) -> Result<bool, Error> {
        if !self
            .opcode_before(target, 4)
            .is_some_and(Opcode::is_load)
        {
            return Ok(false);
        }
        // The region ends by pushing a value; treat the trailing jump as the
        // else marker and probe.
        self.code.rewrite(target - 2, Opcode::MetaElse as u32);
        let Some(end) = self.code.get(target - 1) else {
            return Ok(false);
        };
        let end = end as usize;
        let start = self.ip + 1;
        let Ok(stacks) = self.probe(start, end) else {
            // Not a ternary after all.
            return Ok(false);
        };
        let landed = if stacks.string.len() == 2 {
            Some((Stack::String, stacks.string))
        } else if stacks.uint.len() == 2 {
            Some((Stack::Uint, stacks.uint))
        } else if stacks.float.len() == 2 {
            Some((Stack::Float, stacks.float))
        } else {
            None
        };
        let Some((stack, mut values)) = landed else {
            return Ok(false);
        };
        let condition = self.pop_condition(opcode)?;
        let otherwise = values.pop().ok_or(Error::StackUnderflow { stack, ip: self.ip })?;
        let then = values.pop().ok_or(Error::StackUnderflow { stack, ip: self.ip })?;
        let fragment = format!("({condition}) ? {then} : {otherwise}");
        match stack {
            Stack::String => self.string_stack.push(fragment),
            Stack::Uint => self.uint_stack.push(fragment),
            _ => self.float_stack.push(fragment),
        }
        self.ip = end;
        Ok(true)
    }

    /// Partial decompilation over a window of the code, with output discarded.
    fn probe(&self, start: usize, end: usize) -> Result<Stacks, Error> {
        let window = self
            .code
            .window(start, end)
            .ok_or(Error::Other("empty ternary probe window"))?;
        let mut probe = Decompiler::new(self.dso, window, String::new());
        probe.offset = start + self.offset;
        probe.in_function = self.in_function;
        probe.run()
    }

    fn arg(&self, index: usize) -> Result<u32, Error> {
        self.code
            .get(self.ip + index)
            .ok_or(Error::Truncated { ip: self.ip })
    }

    fn opcode_at(&self, position: usize) -> Option<Opcode> {
        self.code
            .get(position)
            .and_then(|value| Opcode::for_version(self.dso.version, value))
    }

    fn opcode_before(&self, position: usize, back: usize) -> Option<Opcode> {
        position
            .checked_sub(back)
            .and_then(|p| self.opcode_at(p))
    }

    fn jump_target(&self, raw: u32) -> Result<usize, Error> {
        self.code
            .translate_jump(raw, self.offset)
            .ok_or(Error::JumpOutOfRange { ip: self.ip, target: raw as usize })
    }

    fn pop_condition(&mut self, opcode: Opcode) -> Result<String, Error> {
        if opcode == Opcode::JmpIfNot {
            self.pop_uint()
        } else {
            self.pop_flt()
        }
    }

    /// A field assignment while no object cursor is latched belongs to the
    /// object literal under construction.
    fn append_literal_field(&mut self, value: &str) -> Result<(), Error> {
        let line = format!("{}{} = {value};\n", tabs(self.out.level()), self.field()?);
        if self.dso.version < 45 {
            self.uint_stack
                .last_mut()
                .ok_or(Error::StackUnderflow { stack: Stack::Uint, ip: self.ip })?
                .push_str(&line);
        } else {
            self.objects
                .last_mut()
                .ok_or(Error::StackUnderflow { stack: Stack::Object, ip: self.ip })?
                .push_str(&line);
        }
        Ok(())
    }

    fn variable(&self) -> Result<&str, Error> {
        self.current_variable
            .as_deref()
            .ok_or(Error::CursorUnset { ip: self.ip })
    }

    fn object(&self) -> Result<&str, Error> {
        self.current_object
            .as_deref()
            .ok_or(Error::CursorUnset { ip: self.ip })
    }

    fn field(&self) -> Result<&str, Error> {
        self.current_field
            .as_deref()
            .ok_or(Error::CursorUnset { ip: self.ip })
    }

    fn pop_str(&mut self) -> Result<String, Error> {
        self.string_stack
            .pop()
            .ok_or(Error::StackUnderflow { stack: Stack::String, ip: self.ip })
    }

    fn pop_uint(&mut self) -> Result<String, Error> {
        self.uint_stack
            .pop()
            .ok_or(Error::StackUnderflow { stack: Stack::Uint, ip: self.ip })
    }

    fn pop_flt(&mut self) -> Result<String, Error> {
        self.float_stack
            .pop()
            .ok_or(Error::StackUnderflow { stack: Stack::Float, ip: self.ip })
    }

    fn peek_str(&self) -> Result<&str, Error> {
        self.string_stack
            .last()
            .map(String::as_str)
            .ok_or(Error::StackUnderflow { stack: Stack::String, ip: self.ip })
    }

    fn peek_uint(&self) -> Result<&str, Error> {
        self.uint_stack
            .last()
            .map(String::as_str)
            .ok_or(Error::StackUnderflow { stack: Stack::Uint, ip: self.ip })
    }

    fn peek_flt(&self) -> Result<&str, Error> {
        self.float_stack
            .last()
            .map(String::as_str)
            .ok_or(Error::StackUnderflow { stack: Stack::Float, ip: self.ip })
    }
}

/// Render a call or declaration header: `ns::name(args)`, `receiver.name(args)`
/// for method calls (parenthesising a receiver that was built dynamically),
/// `parent::name(args)` for parent calls. Nameless formals become
/// `%unused_var_<i>`.
fn render_call(
    name: &str,
    namespace: &str,
    arguments: &mut Vec<String>,
    call_type: CallType,
) -> Option<String> {
    for (i, argument) in arguments.iter_mut().enumerate() {
        if argument.is_empty() {
            *argument = format!("%unused_var_{i}");
        }
    }
    let mut call = String::new();
    if !namespace.is_empty() {
        call.push_str(namespace);
        call.push_str("::");
    }
    let arguments: &[String] = if call_type == CallType::Method {
        let receiver = arguments.first()?;
        if receiver.contains(' ') {
            // The receiver was built dynamically, e.g. (%obj @ "Handle").call().
            call.push('(');
            call.push_str(receiver);
            call.push_str(").");
        } else {
            call.push_str(receiver);
            call.push('.');
        }
        &arguments[1..]
    } else {
        arguments
    };
    call.push_str(name);
    call.push('(');
    call.push_str(&arguments.join(", "));
    call.push(')');
    Some(call)
}

/// Whether a fragment would parse as a plain number and can stay unquoted.
fn is_number(text: &str) -> bool {
    text.parse::<f64>().is_ok()
}

/// Logical negation with algebraic simplification: single comparisons flip
/// their operator, double negation cancels, compound operands get wrapped.
fn negate_fragment(operand: &str) -> String {
    let count = |pattern: &str| operand.matches(pattern).count();
    if count("!$=") == 1 {
        operand.replacen("!$=", "$=", 1)
    } else if count("$=") == 1 {
        operand.replacen("$=", "!$=", 1)
    } else if count("==") == 1 {
        operand.replacen("==", "!=", 1)
    } else if count("!=") == 1 {
        operand.replacen("!=", "==", 1)
    } else if let Some(plain) = operand.strip_prefix('!') {
        plain.to_string()
    } else if operand.contains(' ') {
        format!("!({operand})")
    } else {
        format!("!{operand}")
    }
}

/// Wrap a sum or difference before it becomes a multiplication or division
/// operand.
fn wrap_sum(operand: String) -> String {
    if operand.contains(" + ") || operand.contains(" - ") {
        format!("({operand})")
    } else {
        operand
    }
}

fn comparison_operator(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::CmpEq => "==",
        Opcode::CmpNe => "!=",
        Opcode::CmpLt => "<",
        Opcode::CmpLe => "<=",
        Opcode::CmpGr => ">",
        _ => ">=",
    }
}

/// The scripting language's separator-concatenation keywords.
fn separator_keyword(separator: char) -> &'static str {
    match separator {
        '\t' => "TAB",
        '\n' => "NL",
        _ => "SPC",
    }
}
