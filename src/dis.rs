//! Bytecode disassembly. Only used behind debug logging and by tests; the
//! exact text is not part of any contract.

use std::fmt::Write;

use crate::chunk::Chunk;
use crate::opcode::OpCode;
use crate::value::Value;

pub fn disassemble(chunk: &Chunk, name: &str) -> String {
    let mut res = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_inst(chunk, offset);
        res.push_str(&text);
        res.push('\n');
        offset = next;
    }
    res
}

/// Renders the instruction at `offset`, returning the text and the offset of
/// the next instruction.
pub fn disassemble_inst(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut res = String::new();
    write!(res, "{offset:04} ").unwrap();
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        res.push_str("   | ");
    } else {
        write!(res, "{:4} ", chunk.lines[offset]).unwrap();
    }

    let Some(op) = OpCode::from_u8(chunk.code[offset]) else {
        write!(res, "Unknown {}", chunk.code[offset]).unwrap();
        return (res, offset + 1);
    };
    match op {
        OpCode::Return
        | OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Not
        | OpCode::Neg
        | OpCode::Add
        | OpCode::Sub
        | OpCode::Mul
        | OpCode::Div
        | OpCode::Print
        | OpCode::CloseUpval => {
            write!(res, "{op:?}").unwrap();
            (res, offset + 1)
        }

        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpval | OpCode::SetUpval | OpCode::Call => {
            write!(res, "{:-16} {:4}", format!("{op:?}"), chunk.code[offset + 1]).unwrap();
            (res, offset + 2)
        }

        OpCode::Const
        | OpCode::GetGlobal
        | OpCode::DefGlobal
        | OpCode::SetGlobal
        | OpCode::GetProp
        | OpCode::SetProp
        | OpCode::Class
        | OpCode::Method => {
            let c = chunk.code[offset + 1] as usize;
            write!(res, "{:-16} {:4} '{}'", format!("{op:?}"), c, const_text(chunk, c)).unwrap();
            (res, offset + 2)
        }

        OpCode::Jump | OpCode::JumpUnless | OpCode::Loop => {
            let operand = Chunk::read_u16(&chunk.code, offset + 1) as i64;
            let delta = if op == OpCode::Loop { -operand } else { operand };
            let target = offset as i64 + 3 + delta;
            write!(res, "{:-16} {:4} -> {}", format!("{op:?}"), offset, target).unwrap();
            (res, offset + 3)
        }

        OpCode::Invoke => {
            let c = chunk.code[offset + 1] as usize;
            let argc = chunk.code[offset + 2];
            write!(
                res,
                "{:-16} ({argc} args) {c:4} '{}'",
                "Invoke",
                const_text(chunk, c)
            )
            .unwrap();
            (res, offset + 3)
        }

        OpCode::Closure => {
            let c = chunk.code[offset + 1] as usize;
            write!(res, "{:-16} {:4} '{}'", "Closure", c, const_text(chunk, c)).unwrap();
            let mut next = offset + 2;
            if let Some(Value::Fun(fun)) = chunk.consts.get(c) {
                for _ in 0..fun.upval_count {
                    let kind = if chunk.code[next] == 1 { "local" } else { "upval" };
                    let idx = chunk.code[next + 1];
                    write!(res, "\n{next:04}      |                     {kind} {idx}").unwrap();
                    next += 2;
                }
            }
            (res, next)
        }
    }
}

fn const_text(chunk: &Chunk, idx: usize) -> String {
    match chunk.consts.get(idx) {
        Some(v) => v.to_string(),
        None => "INVALID".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::intern;

    #[test]
    fn one_line_per_instruction_with_line_markers() {
        let mut chunk = Chunk::new();
        let c = chunk.add_const(Value::Num(1.2));
        chunk.write_op(OpCode::Const, 123);
        chunk.write_u8(c as u8, 123);
        chunk.write_op(OpCode::Neg, 123);
        chunk.write_op(OpCode::Return, 124);

        let text = disassemble(&chunk, "test");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "== test ==");
        assert!(lines[1].starts_with("0000  123 Const"));
        assert!(lines[1].contains("'1.2'"));
        assert!(lines[2].contains("   | "));
        assert!(lines[3].contains("Return"));
    }

    #[test]
    fn jump_targets_are_resolved() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write_u8(0, 1);
        chunk.write_u8(2, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Nil, 1);

        let (text, next) = disassemble_inst(&chunk, 0);
        assert_eq!(next, 3);
        assert!(text.contains("-> 5"));
    }

    #[test]
    fn global_ops_show_the_name_constant() {
        let mut chunk = Chunk::new();
        let c = chunk.add_const(Value::Str(intern("foo")));
        chunk.write_op(OpCode::GetGlobal, 1);
        chunk.write_u8(c as u8, 1);

        let (text, next) = disassemble_inst(&chunk, 0);
        assert_eq!(next, 2);
        assert!(text.contains("GetGlobal"));
        assert!(text.contains("\"foo\""));
    }
}
