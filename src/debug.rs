use crate::chunk::{Chunk, OpCode};
use crate::objects::object_function::ObjectFunction;
use crate::value::{format_value, Value};

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.lines[offset]);
    }

    let instruction = chunk.code[offset];
    let opcode = match OpCode::from_byte(instruction) {
        Some(opcode) => opcode,
        None => {
            println!("Unknown opcode {}", instruction);
            return offset + 1;
        }
    };

    match opcode {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(opcode, chunk, offset),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(opcode, chunk, offset),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(opcode, 1, chunk, offset),
        OpCode::Loop => jump_instruction(opcode, -1, chunk, offset),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(opcode, chunk, offset),
        OpCode::Closure => closure_instruction(chunk, offset),
        _ => simple_instruction(opcode, offset),
    }
}

fn simple_instruction(opcode: OpCode, offset: usize) -> usize {
    println!("{}", opcode);
    offset + 1
}

fn constant_instruction(opcode: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    println!(
        "{:<16} {:>4} '{}'",
        opcode.to_string(),
        constant,
        format_value(&chunk.constants[constant])
    );
    offset + 2
}

fn byte_instruction(opcode: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{:<16} {:>4}", opcode.to_string(), slot);
    offset + 2
}

fn jump_instruction(opcode: OpCode, sign: i64, chunk: &Chunk, offset: usize) -> usize {
    let jump = (((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16) as i64;
    println!(
        "{:<16} {:>4} -> {}",
        opcode.to_string(),
        offset,
        offset as i64 + 3 + sign * jump
    );
    offset + 3
}

fn invoke_instruction(opcode: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    let arg_count = chunk.code[offset + 2];
    println!(
        "{:<16} ({} args) {:>4} '{}'",
        opcode.to_string(),
        arg_count,
        constant,
        format_value(&chunk.constants[constant])
    );
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> usize {
    let mut offset = offset + 1;
    let constant = chunk.code[offset] as usize;
    offset += 1;
    println!(
        "{:<16} {:>4} '{}'",
        OpCode::Closure.to_string(),
        constant,
        format_value(&chunk.constants[constant])
    );

    let function = match chunk.constants[constant] {
        Value::Obj(object) => object as *mut ObjectFunction,
        _ => return offset,
    };
    let upvalue_count = unsafe { (*function).upvalue_count };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        println!(
            "{:04}      |                     {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }
    offset
}
