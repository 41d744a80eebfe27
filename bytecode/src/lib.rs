mod builder;
mod decoder;
mod instruction;
mod op;
mod source_map;

pub use builder::{BytecodeBuilder, Label};
pub use decoder::{BytecodeDecoder, DecodeError, decode_at};
pub use instruction::Instruction;
pub use op::Op;
pub use source_map::{SourceMapBuilder, source_map_lookup};

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::new(bytes)
            .collect::<Result<_, _>>()
            .expect("well-formed bytecode")
    }

    #[test]
    fn round_trip_narrow() {
        let mut b = BytecodeBuilder::new();
        b.load_const(1, 42);
        b.set_null(2);
        b.set_empty_list(3);
        b.copy(4, 1);
        b.move_(5, 4);
        b.swap(5, 1);
        b.cast(6, 5, 9);
        b.add_int(7, 1, 2);
        b.div_float(8, 1, 2);
        b.equals(9, 7, 8);
        b.increment(7);
        b.get_index(10, 3, 7);
        b.set_index(3, 7, 10);
        b.append(3, 1);
        b.length(11, 3);
        b.call(2, 12, 2, 14);
        b.call_keyed(3, 12, 1, 14, 15);
        b.call_func(12, 1, 14);
        b.call_func_apply(12, 13, 14);
        b.call_method(100, 3, 2, 20, 500);
        b.make_func(16, 4, 1, 2);
        b.splat_bindings(0, 2);
        b.varargs_to_list(1);
        b.grow_frame(40);
        b.native(6);
        b.get_state(17, 8);
        b.save_state(8, 17);
        b.retain_frame();
        b.pause();
        b.return_();

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::LoadConst { dst: 1, idx: 42 },
            Instruction::SetNull { dst: 2 },
            Instruction::SetEmptyList { dst: 3 },
            Instruction::Copy { dst: 4, src: 1 },
            Instruction::Move { dst: 5, src: 4 },
            Instruction::Swap { a: 5, b: 1 },
            Instruction::Cast { dst: 6, src: 5, type_idx: 9 },
            Instruction::AddInt { dst: 7, lhs: 1, rhs: 2 },
            Instruction::DivFloat { dst: 8, lhs: 1, rhs: 2 },
            Instruction::Equals { dst: 9, lhs: 7, rhs: 8 },
            Instruction::Increment { reg: 7 },
            Instruction::GetIndex { dst: 10, container: 3, index: 7 },
            Instruction::SetIndex { container: 3, index: 7, src: 10 },
            Instruction::Append { list: 3, src: 1 },
            Instruction::Length { dst: 11, container: 3 },
            Instruction::Call { block_idx: 2, base: 12, argc: 2, out: 14 },
            Instruction::CallKeyed { block_idx: 3, base: 12, argc: 1, out: 14, key: 15 },
            Instruction::CallFunc { base: 12, argc: 1, out: 14 },
            Instruction::CallFuncApply { func: 12, args: 13, out: 14 },
            Instruction::CallMethod { name_idx: 100, base: 3, argc: 2, out: 20, site: 500 },
            Instruction::MakeFunc { dst: 16, block_idx: 4, first: 1, count: 2 },
            Instruction::SplatBindings { first: 0, count: 2 },
            Instruction::VarargsToList { first: 1 },
            Instruction::GrowFrame { size: 40 },
            Instruction::Native { idx: 6 },
            Instruction::GetState { dst: 17, name_idx: 8 },
            Instruction::SaveState { name_idx: 8, src: 17 },
            Instruction::RetainFrame,
            Instruction::Pause,
            Instruction::Return,
        ]);
    }

    #[test]
    fn round_trip_wide() {
        let mut b = BytecodeBuilder::new();
        b.copy(300, 5);
        b.copy(2, 400);
        b.sub_int(1, 2, 1000);
        b.call(1, 500, 4, 2);
        b.call_method(1, 2, 1, 700, 3);
        b.get_state(256, 1);
        b.save_state(1, 999);

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::Copy { dst: 300, src: 5 },
            Instruction::Copy { dst: 2, src: 400 },
            Instruction::SubInt { dst: 1, lhs: 2, rhs: 1000 },
            Instruction::Call { block_idx: 1, base: 500, argc: 4, out: 2 },
            Instruction::CallMethod { name_idx: 1, base: 2, argc: 1, out: 700, site: 3 },
            Instruction::GetState { dst: 256, name_idx: 1 },
            Instruction::SaveState { name_idx: 1, src: 999 },
        ]);
    }

    #[test]
    fn forward_jump() {
        let mut b = BytecodeBuilder::new();
        b.load_int(0, 1);
        let label = b.jump_if_not(0);
        b.load_int(1, 2);
        b.bind(label);
        b.return_();

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::LoadInt { dst: 0, value: 1 },
            Instruction::JumpIfNot { cond: 0, offset: 3 },
            Instruction::LoadInt { dst: 1, value: 2 },
            Instruction::Return,
        ]);
    }

    #[test]
    fn backward_jump() {
        let mut b = BytecodeBuilder::new();
        let loop_top = b.current_offset();
        b.increment(0);
        b.jump_back(loop_top);

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::Increment { reg: 0 },
            Instruction::Jump { offset: -5 },
        ]);
    }

    #[test]
    fn counted_loop_shape() {
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        let done = b.jump_if_done(1, 0);
        b.increment(1);
        b.jump_back(top);
        b.bind(done);
        b.return_();

        // JumpIfDone(5) + Increment(2) + Jump(3) = 10 bytes to the exit.
        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::JumpIfDone { index: 1, container: 0, offset: 5 },
            Instruction::Increment { reg: 1 },
            Instruction::Jump { offset: -10 },
            Instruction::Return,
        ]);
    }

    #[test]
    fn conditional_backward_jump() {
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        b.less_than(2, 0, 1);
        b.jump_back_if(2, top);

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::LessThan { dst: 2, lhs: 0, rhs: 1 },
            Instruction::JumpIf { cond: 2, offset: -8 },
        ]);
    }

    #[test]
    fn display_instructions() {
        assert_eq!(
            Instruction::CallMethod { name_idx: 5, base: 3, argc: 2, out: 4, site: 10 }.to_string(),
            "CallMethod #5 r3 2 -> r4 ~10"
        );
        assert_eq!(Instruction::Jump { offset: -7 }.to_string(), "Jump -7");
        assert_eq!(
            Instruction::JumpIfDone { index: 1, container: 2, offset: 9 }.to_string(),
            "JumpIfDone r1, r2 +9"
        );
        assert_eq!(
            Instruction::AddInt { dst: 2, lhs: 0, rhs: 1 }.to_string(),
            "AddInt r2, r0, r1"
        );
        assert_eq!(
            Instruction::SaveState { name_idx: 3, src: 1 }.to_string(),
            "SaveState #3, r1"
        );
    }

    #[test]
    fn copy_narrow_size() {
        let mut b = BytecodeBuilder::new();
        b.copy(1, 2);
        assert_eq!(b.as_bytes().len(), 3);
    }

    #[test]
    fn copy_wide_size() {
        let mut b = BytecodeBuilder::new();
        b.copy(256, 2);
        assert_eq!(b.as_bytes().len(), 6);
        assert_eq!(b.as_bytes()[0], Op::Wide as u8);
    }

    #[test]
    fn load_int_8bit() {
        let mut b = BytecodeBuilder::new();
        b.load_int(0, 0);
        b.load_int(1, 127);
        b.load_int(2, -128);
        b.load_int(3, -1);

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::LoadInt { dst: 0, value: 0 },
            Instruction::LoadInt { dst: 1, value: 127 },
            Instruction::LoadInt { dst: 2, value: -128 },
            Instruction::LoadInt { dst: 3, value: -1 },
        ]);
    }

    #[test]
    fn load_int_8bit_size() {
        let mut b = BytecodeBuilder::new();
        b.load_int(0, 42);
        assert_eq!(b.as_bytes().len(), 3);
        assert_eq!(b.as_bytes()[0], Op::LoadInt as u8);
    }

    #[test]
    fn load_int_16bit() {
        let mut b = BytecodeBuilder::new();
        b.load_int(0, 128);
        b.load_int(0, -32768);
        b.load_int(300, 5);

        let bytes = b.into_bytes();
        assert_eq!(bytes[0], Op::Wide as u8);
        assert_eq!(decode_all(&bytes), vec![
            Instruction::LoadInt { dst: 0, value: 128 },
            Instruction::LoadInt { dst: 0, value: -32768 },
            Instruction::LoadInt { dst: 300, value: 5 },
        ]);
    }

    #[test]
    fn load_int_32bit() {
        let mut b = BytecodeBuilder::new();
        b.load_int(1, 100_000);
        b.load_int(1, i32::MIN);

        let bytes = b.into_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[0], Op::ExtraWide as u8);
        assert_eq!(bytes[1], Op::LoadInt as u8);
        assert_eq!(decode_all(&bytes), vec![
            Instruction::LoadInt { dst: 1, value: 100_000 },
            Instruction::LoadInt { dst: 1, value: i32::MIN },
        ]);
    }

    #[test]
    fn decode_at_reports_next_pc() {
        let mut b = BytecodeBuilder::new();
        b.add_int(2, 0, 1);
        b.return_();
        let bytes = b.into_bytes();

        let (first, next) = decode_at(&bytes, 0).expect("decode");
        assert_eq!(first, Instruction::AddInt { dst: 2, lhs: 0, rhs: 1 });
        assert_eq!(next, 4);
        let (second, end) = decode_at(&bytes, next).expect("decode");
        assert_eq!(second, Instruction::Return);
        assert_eq!(end, bytes.len());
    }

    #[test]
    fn truncated_bytecode_is_an_error() {
        let mut b = BytecodeBuilder::new();
        b.call(1, 2, 3, 4);
        let bytes = b.into_bytes();
        let cut = &bytes[..bytes.len() - 1];

        assert_eq!(decode_at(cut, 0), Err(DecodeError::Truncated(5)));
    }

    #[test]
    fn invalid_opcode_is_an_error() {
        assert_eq!(
            decode_at(&[0xFF], 0),
            Err(DecodeError::InvalidOpcode { byte: 0xFF, offset: 0 })
        );
    }

    #[test]
    fn extra_wide_only_before_load_int() {
        let bytes = [Op::ExtraWide as u8, Op::Copy as u8, 0, 0, 0, 0];
        assert_eq!(
            decode_at(&bytes, 0),
            Err(DecodeError::InvalidPrefix { op: Op::Copy, offset: 0 })
        );
    }

    #[test]
    fn iterator_stops_after_error() {
        let mut decoder = BytecodeDecoder::new(&[Op::Return as u8, 0xFE, Op::Return as u8]);
        assert_eq!(decoder.next(), Some(Ok(Instruction::Return)));
        assert!(matches!(decoder.next(), Some(Err(_))));
        assert_eq!(decoder.next(), None);
    }

    #[test]
    fn narrow_has_no_wide_prefix() {
        let mut b = BytecodeBuilder::new();
        b.set_null(255);
        let bytes = b.into_bytes();
        assert_eq!(bytes.len(), 2);
        assert_eq!(bytes[0], Op::SetNull as u8);
    }
}
