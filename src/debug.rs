use std::collections::HashMap;

use crate::chunk::{Chunk, OpCode};
use crate::objects::object::ObjectType;
use crate::objects::object_function::ObjectFunction;
use crate::value::{as_ref, is_ref_of, value_to_string};

/// Jump-target annotations for `-l`: maps a code offset to a label number.
#[derive(Default)]
pub struct Labels {
    targets: HashMap<usize, usize>,
    enabled: bool,
}

impl Labels {
    /// Scan the chunk once and number every jump destination.
    pub fn collect(chunk: &Chunk) -> Labels {
        let mut targets = HashMap::new();
        let mut offset = 0;
        while offset < chunk.len() {
            if let Some((destination, next)) = jump_destination(chunk, offset) {
                let count = targets.len();
                targets.entry(destination).or_insert(count);
                offset = next;
            } else {
                offset = skip_instruction(chunk, offset);
            }
        }
        Labels {
            targets,
            enabled: true,
        }
    }

    fn label_of(&self, offset: usize) -> Option<usize> {
        if self.enabled {
            self.targets.get(&offset).copied()
        } else {
            None
        }
    }
}

/// For jump instructions: (destination, offset after the instruction).
fn jump_destination(chunk: &Chunk, offset: usize) -> Option<(usize, usize)> {
    let op = OpCode::from_byte(chunk.code[offset])?;
    let operand = || chunk.read_u16(offset + 1) as usize;
    match op {
        OpCode::Jump
        | OpCode::JumpIfFalse
        | OpCode::JumpIfTrue
        | OpCode::PopJumpIfFalse
        | OpCode::PopJumpIfTrue
        | OpCode::JumpIfNotEqual
        | OpCode::JumpIfNotAbsence
        | OpCode::JumpForIter
        | OpCode::SetTry => Some((offset + 3 + operand(), offset + 3)),
        OpCode::JumpBack => Some((offset + 3 - operand(), offset + 3)),
        _ => None,
    }
}

/// Width in bytes of the instruction at `offset`.
fn skip_instruction(chunk: &Chunk, offset: usize) -> usize {
    let op = match OpCode::from_byte(chunk.code[offset]) {
        Some(op) => op,
        None => return offset + 1,
    };
    match op {
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::CopyN
        | OpCode::Swap
        | OpCode::DimensionArray => offset + 2,
        OpCode::LoadConstant
        | OpCode::DefGlobal
        | OpCode::DefGlobalConst
        | OpCode::DefPubGlobal
        | OpCode::DefPubGlobalConst
        | OpCode::Export
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::MakeClass
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::SuperAccess
        | OpCode::MakeStaticField
        | OpCode::MakeArray
        | OpCode::UnpackArray
        | OpCode::Jump
        | OpCode::JumpBack
        | OpCode::JumpIfFalse
        | OpCode::JumpIfTrue
        | OpCode::PopJumpIfFalse
        | OpCode::PopJumpIfTrue
        | OpCode::JumpIfNotEqual
        | OpCode::JumpIfNotAbsence
        | OpCode::JumpForIter
        | OpCode::SetTry => offset + 3,
        OpCode::PropertyInvoke | OpCode::SuperInvoke => offset + 4,
        OpCode::MakeClosure => {
            let constant = chunk.read_u16(offset + 1) as usize;
            let upvalue_count = function_upvalue_count(chunk, constant);
            offset + 3 + upvalue_count * 2
        }
        _ => offset + 1,
    }
}

fn function_upvalue_count(chunk: &Chunk, constant: usize) -> usize {
    let value = chunk.get_constant(constant);
    if is_ref_of(value, ObjectType::ObjFunction) {
        unsafe { (*(as_ref(value) as *mut ObjectFunction)).upvalue_count }
    } else {
        0
    }
}

/// Disassemble a function and every function nested in its constant pool.
pub fn disassemble_function(function: &ObjectFunction, show_labels: bool) {
    let name = if function.name.is_empty() {
        "<script>".to_string()
    } else {
        function.name.clone()
    };
    disassemble_chunk(&function.chunk, &name, show_labels);
    for constant in function.chunk.iter_constants() {
        if is_ref_of(constant, ObjectType::ObjFunction) {
            let nested = unsafe { &*(as_ref(constant) as *mut ObjectFunction) };
            disassemble_function(nested, show_labels);
        }
    }
}

pub fn disassemble_chunk(chunk: &Chunk, name: &str, show_labels: bool) {
    println!("== {} ==", name);

    let mut labels = if show_labels {
        Labels::collect(chunk)
    } else {
        Labels::default()
    };
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset, &mut labels);
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize, labels: &mut Labels) -> usize {
    if let Some(label) = labels.label_of(offset) {
        println!("L{}:", label);
    }
    print!("{:08} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        print!("{:>8} ", "|");
    } else {
        print!("{:>8} ", chunk.lines[offset]);
    }

    let instruction = chunk.code[offset];
    let op = match OpCode::from_byte(instruction) {
        Some(op) => op,
        None => {
            println!("Unknown opcode {}", instruction);
            return offset + 1;
        }
    };

    match op {
        OpCode::LoadConstant
        | OpCode::DefGlobal
        | OpCode::DefGlobalConst
        | OpCode::DefPubGlobal
        | OpCode::DefPubGlobalConst
        | OpCode::Export
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::MakeClass
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::SuperAccess
        | OpCode::MakeStaticField => constant_instruction(op, chunk, offset),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::CopyN
        | OpCode::Swap
        | OpCode::DimensionArray => byte_instruction(op, chunk, offset),
        OpCode::MakeArray | OpCode::UnpackArray => u16_instruction(op, chunk, offset),
        OpCode::Jump
        | OpCode::JumpBack
        | OpCode::JumpIfFalse
        | OpCode::JumpIfTrue
        | OpCode::PopJumpIfFalse
        | OpCode::PopJumpIfTrue
        | OpCode::JumpIfNotEqual
        | OpCode::JumpIfNotAbsence
        | OpCode::JumpForIter
        | OpCode::SetTry => jump_instruction(op, chunk, offset, labels),
        OpCode::PropertyInvoke | OpCode::SuperInvoke => invoke_instruction(op, chunk, offset),
        OpCode::MakeClosure => closure_instruction(chunk, offset),
        _ => simple_instruction(op, offset),
    }
}

fn simple_instruction(op: OpCode, offset: usize) -> usize {
    println!("{}", op);
    offset + 1
}

fn byte_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let operand = chunk.code[offset + 1];
    println!("{:<16} {:>4}", op.to_string(), operand);
    offset + 2
}

fn u16_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let operand = chunk.read_u16(offset + 1);
    println!("{:<16} {:>4}", op.to_string(), operand);
    offset + 3
}

fn constant_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.read_u16(offset + 1) as usize;
    println!(
        "{:<16} {:>4} '{}'",
        op.to_string(),
        constant,
        value_to_string(chunk.get_constant(constant))
    );
    offset + 3
}

fn jump_instruction(op: OpCode, chunk: &Chunk, offset: usize, labels: &mut Labels) -> usize {
    let operand = chunk.read_u16(offset + 1) as usize;
    let destination = if op == OpCode::JumpBack {
        offset + 3 - operand
    } else {
        offset + 3 + operand
    };
    match labels.label_of(destination) {
        Some(label) => println!("{:<16} {:>4} -> L{}", op.to_string(), operand, label),
        None => println!("{:<16} {:>4} -> {}", op.to_string(), operand, destination),
    }
    offset + 3
}

fn invoke_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.read_u16(offset + 1) as usize;
    let arg_count = chunk.code[offset + 3];
    println!(
        "{:<16} {:>4} '{}' ({} args)",
        op.to_string(),
        constant,
        value_to_string(chunk.get_constant(constant)),
        arg_count
    );
    offset + 4
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.read_u16(offset + 1) as usize;
    println!(
        "{:<16} {:>4} {}",
        OpCode::MakeClosure.to_string(),
        constant,
        value_to_string(chunk.get_constant(constant))
    );
    let upvalue_count = function_upvalue_count(chunk, constant);
    let mut position = offset + 3;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[position];
        let index = chunk.code[position + 1];
        println!(
            "{:08} {:>8} | {:<14} {}",
            position,
            "",
            if is_local == 1 { "local" } else { "upvalue" },
            index
        );
        position += 2;
    }
    position
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::make_int_value;

    #[test]
    fn test_skip_widths_cover_all_opcodes() {
        // a chunk with one of each fixed-width instruction disassembles to
        // the exact length
        let mut chunk = Chunk::new();
        let constant = chunk.add_constant(make_int_value(1)) as u16;
        chunk.write(OpCode::LoadConstant.to_byte(), 1);
        chunk.write_u16(constant, 1);
        chunk.write(OpCode::GetLocal.to_byte(), 1);
        chunk.write(0, 1);
        chunk.write(OpCode::Jump.to_byte(), 1);
        chunk.write_u16(1, 1);
        chunk.write(OpCode::Nop.to_byte(), 1);
        chunk.write(OpCode::Return.to_byte(), 1);

        let mut offset = 0;
        let mut count = 0;
        while offset < chunk.len() {
            offset = skip_instruction(&chunk, offset);
            count += 1;
        }
        assert_eq!(offset, chunk.len());
        assert_eq!(count, 5);
    }

    #[test]
    fn test_labels_number_jump_targets() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Jump.to_byte(), 1);
        chunk.write_u16(1, 1); // jumps over the Nop
        chunk.write(OpCode::Nop.to_byte(), 1);
        chunk.write(OpCode::Return.to_byte(), 1);

        let labels = Labels::collect(&chunk);
        assert_eq!(labels.label_of(4), Some(0));
        assert_eq!(labels.label_of(3), None);
    }
}
