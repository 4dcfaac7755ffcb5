use torque_dso::decompile::{Error, Stack};
use torque_dso::{Dso, Opcode, decompile_to_string};

/// Builds a string-table blob; offset 0 always holds the empty string.
struct Strings {
    bytes: Vec<u8>,
}

impl Strings {
    fn new() -> Self {
        Self { bytes: vec![0] }
    }

    fn add(&mut self, text: &str) -> u32 {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(text.as_bytes());
        self.bytes.push(0);
        offset
    }
}

fn module(version: u32, strings: Strings, code: Vec<u32>) -> Dso {
    Dso {
        version,
        global_strings: strings.bytes,
        code,
        ..Dso::default()
    }
}

fn op(opcode: Opcode) -> u32 {
    opcode as u32
}

#[test]
fn empty_return_emits_nothing() {
    let dso = module(45, Strings::new(), vec![op(Opcode::ReturnVoid)]);
    assert_eq!(decompile_to_string(&dso).unwrap(), "");
}

#[test]
fn simple_assignment() {
    let mut strings = Strings::new();
    let x = strings.add("$x");
    let code = vec![
        op(Opcode::LoadImmedUint),
        42,
        op(Opcode::SetCurVarCreate),
        x,
        0,
        op(Opcode::SaveVarUint),
        op(Opcode::UintToNone),
    ];
    let dso = module(45, strings, code);
    assert_eq!(decompile_to_string(&dso).unwrap(), "$x = 42;\n");
}

#[test]
fn simple_assignment_in_a_legacy_dialect() {
    let mut strings = Strings::new();
    let x = strings.add("$x");
    // Raw dialect-36 values: one-slot string references and the old numbering.
    let code = vec![63, 42, 35, x, 41, 62];
    let dso = module(36, strings, code);
    assert_eq!(decompile_to_string(&dso).unwrap(), "$x = 42;\n");
}

#[test]
fn short_circuit_or_keeps_operands_bare() {
    let mut strings = Strings::new();
    let a = strings.add("$a");
    let b = strings.add("$b");
    let c = strings.add("$c");
    let code = vec![
        op(Opcode::SetCurVar),
        a,
        0,
        op(Opcode::LoadVarUint),
        op(Opcode::JmpIfNp),
        10,
        op(Opcode::SetCurVar),
        b,
        0,
        op(Opcode::LoadVarUint),
        op(Opcode::SetCurVarCreate),
        c,
        0,
        op(Opcode::SaveVarUint),
        op(Opcode::UintToNone),
    ];
    let dso = module(45, strings, code);
    assert_eq!(decompile_to_string(&dso).unwrap(), "$c = $a || $b;\n");
}

#[test]
fn ternary_beats_if_else() {
    let mut strings = Strings::new();
    let c = strings.add("$c");
    let yes = strings.add("yes");
    let no = strings.add("no");
    let x = strings.add("$x");
    let code = vec![
        op(Opcode::SetCurVar),
        c,
        0,
        op(Opcode::LoadVarUint),
        op(Opcode::JmpIfNot),
        10,
        op(Opcode::LoadImmedStr),
        yes,
        op(Opcode::Jmp),
        12,
        op(Opcode::LoadImmedStr),
        no,
        op(Opcode::SetCurVarCreate),
        x,
        0,
        op(Opcode::SaveVarStr),
        op(Opcode::StrToNone),
    ];
    let dso = module(45, strings, code);
    assert_eq!(
        decompile_to_string(&dso).unwrap(),
        "$x = ($c) ? \"yes\" : \"no\";\n"
    );
}

#[test]
fn while_loop_with_break() {
    let mut strings = Strings::new();
    let i = strings.add("$i");
    let code = vec![
        op(Opcode::SetCurVar),
        i,
        0,
        op(Opcode::LoadVarUint),
        op(Opcode::JmpIfNot),
        14,
        op(Opcode::Jmp),
        14,
        op(Opcode::SetCurVar),
        i,
        0,
        op(Opcode::LoadVarUint),
        op(Opcode::JmpIf),
        6,
    ];
    let dso = module(45, strings, code);
    assert_eq!(
        decompile_to_string(&dso).unwrap(),
        "while ($i)\n{\n\tbreak;\n}\n"
    );
}

#[test]
fn while_loop_with_continue() {
    let mut strings = Strings::new();
    let i = strings.add("$i");
    let code = vec![
        op(Opcode::SetCurVar),
        i,
        0,
        op(Opcode::LoadVarUint),
        op(Opcode::JmpIfNot),
        14,
        op(Opcode::Jmp),
        8,
        op(Opcode::SetCurVar),
        i,
        0,
        op(Opcode::LoadVarUint),
        op(Opcode::JmpIf),
        6,
    ];
    let dso = module(45, strings, code);
    assert_eq!(
        decompile_to_string(&dso).unwrap(),
        "while ($i)\n{\n\tcontinue;\n}\n"
    );
}

#[test]
fn if_with_else_branch() {
    let mut strings = Strings::new();
    let a = strings.add("$a");
    let b = strings.add("$b");
    let code = vec![
        op(Opcode::SetCurVar),
        a,
        0,
        op(Opcode::LoadVarUint),
        op(Opcode::JmpIfNot),
        15,
        op(Opcode::SetCurVarCreate),
        b,
        0,
        op(Opcode::LoadImmedUint),
        1,
        op(Opcode::SaveVarUint),
        op(Opcode::UintToNone),
        op(Opcode::Jmp),
        22,
        op(Opcode::SetCurVarCreate),
        b,
        0,
        op(Opcode::LoadImmedUint),
        2,
        op(Opcode::SaveVarUint),
        op(Opcode::UintToNone),
    ];
    let dso = module(45, strings, code);
    assert_eq!(
        decompile_to_string(&dso).unwrap(),
        "if ($a)\n{\n\t$b = 1;\n}\nelse\n{\n\t$b = 2;\n}\n"
    );
}

#[test]
fn plain_if_closes_at_the_jump_target() {
    let mut strings = Strings::new();
    let a = strings.add("$a");
    let b = strings.add("$b");
    let code = vec![
        op(Opcode::SetCurVar),
        a,
        0,
        op(Opcode::LoadVarUint),
        op(Opcode::JmpIfNot),
        13,
        op(Opcode::SetCurVarCreate),
        b,
        0,
        op(Opcode::LoadImmedUint),
        1,
        op(Opcode::SaveVarUint),
        op(Opcode::UintToNone),
    ];
    let dso = module(45, strings, code);
    assert_eq!(
        decompile_to_string(&dso).unwrap(),
        "if ($a)\n{\n\t$b = 1;\n}\n"
    );
}

#[test]
fn empty_if_body_is_skipped() {
    let mut strings = Strings::new();
    let a = strings.add("$a");
    let code = vec![
        op(Opcode::SetCurVar),
        a,
        0,
        op(Opcode::LoadVarUint),
        op(Opcode::JmpIfNot),
        6,
    ];
    let dso = module(45, strings, code);
    assert_eq!(decompile_to_string(&dso).unwrap(), "");
}

#[test]
fn object_literal_with_fields() {
    let mut strings = Strings::new();
    let class = strings.add("SimObject");
    let name = strings.add("Foo");
    let a = strings.add("a");
    let one = strings.add("1");
    let b = strings.add("b");
    let hi = strings.add("hi");
    let code = vec![
        op(Opcode::LoadImmedUint),
        0,
        op(Opcode::PushFrame),
        op(Opcode::LoadImmedIdent),
        class,
        0,
        op(Opcode::Push),
        op(Opcode::LoadImmedStr),
        name,
        op(Opcode::Push),
        op(Opcode::CreateObject),
        0,
        0,
        0,
        0,
        0,
        0,
        0,
        op(Opcode::SetCurObjectNew),
        op(Opcode::SetCurField),
        a,
        0,
        op(Opcode::LoadImmedStr),
        one,
        op(Opcode::SaveFieldStr),
        op(Opcode::StrToNone),
        op(Opcode::SetCurField),
        b,
        0,
        op(Opcode::LoadImmedStr),
        hi,
        op(Opcode::SaveFieldStr),
        op(Opcode::StrToNone),
        op(Opcode::AddObject),
        1,
        op(Opcode::EndObject),
        1,
        op(Opcode::FinishObject),
        op(Opcode::UintToNone),
    ];
    let dso = module(45, strings, code);
    assert_eq!(
        decompile_to_string(&dso).unwrap(),
        "new SimObject(\"Foo\")\n{\n\ta = 1;\n\tb = \"hi\";\n}\n"
    );
}

#[test]
fn empty_object_literal_drops_its_body() {
    let mut strings = Strings::new();
    let class = strings.add("SimObject");
    let code = vec![
        op(Opcode::LoadImmedUint),
        0,
        op(Opcode::PushFrame),
        op(Opcode::LoadImmedIdent),
        class,
        0,
        op(Opcode::Push),
        op(Opcode::LoadImmedStr),
        0,
        op(Opcode::Push),
        op(Opcode::CreateObject),
        0,
        0,
        0,
        0,
        0,
        0,
        0,
        op(Opcode::SetCurObjectNew),
        op(Opcode::AddObject),
        1,
        op(Opcode::EndObject),
        1,
        op(Opcode::FinishObject),
        op(Opcode::UintToNone),
    ];
    let dso = module(45, strings, code);
    assert_eq!(decompile_to_string(&dso).unwrap(), "new SimObject()\n");
}

#[test]
fn foreach_loop() {
    let mut strings = Strings::new();
    let list = strings.add("$list");
    let item = strings.add("%item");
    let a = strings.add("$a");
    let code = vec![
        op(Opcode::SetCurVar),
        list,
        0,
        op(Opcode::LoadVarStr),
        op(Opcode::IterBegin),
        item,
        0,
        0,
        op(Opcode::Iter),
        0,
        op(Opcode::SetCurVarCreate),
        a,
        0,
        op(Opcode::LoadImmedUint),
        1,
        op(Opcode::SaveVarUint),
        op(Opcode::UintToNone),
        op(Opcode::Jmp),
        8,
        op(Opcode::IterEnd),
    ];
    let dso = module(45, strings, code);
    assert_eq!(
        decompile_to_string(&dso).unwrap(),
        "foreach (%item in $list)\n{\n\t$a = 1;\n}\n"
    );
}

#[test]
fn function_declaration_with_body() {
    let mut strings = Strings::new();
    let foo = strings.add("foo");
    let a = strings.add("%a");
    let b = strings.add("%b");
    let code = vec![
        op(Opcode::FuncDecl),
        foo,
        0,
        0,
        0,
        0,
        0,
        1,
        19,
        2,
        a,
        0,
        b,
        0,
        op(Opcode::SetCurVar),
        a,
        0,
        op(Opcode::LoadVarStr),
        op(Opcode::Return),
    ];
    let dso = module(45, strings, code);
    assert_eq!(
        decompile_to_string(&dso).unwrap(),
        "function foo(%a, %b)\n{\n\treturn %a;\n}\n\n"
    );
}

#[test]
fn function_declaration_names_unused_formals() {
    let mut strings = Strings::new();
    let name = strings.add("onWake");
    let namespace = strings.add("GuiPane");
    let code = vec![
        op(Opcode::FuncDecl),
        name,
        0,
        namespace,
        0,
        0,
        0,
        0,
        13,
        1,
        0,
        0,
        op(Opcode::ReturnVoid),
    ];
    let dso = module(45, strings, code);
    assert_eq!(
        decompile_to_string(&dso).unwrap(),
        "function GuiPane::onWake(%unused_var_0)\n{\n}\n\n"
    );
}

#[test]
fn string_concatenation_operators() {
    let mut strings = Strings::new();
    let a = strings.add("a");
    let b = strings.add("$b");
    let x = strings.add("$x");
    // $x = "a" @ $b;
    let code = vec![
        op(Opcode::LoadImmedStr),
        a,
        op(Opcode::AdvanceStr),
        op(Opcode::SetCurVar),
        b,
        0,
        op(Opcode::LoadVarStr),
        op(Opcode::RewindStr),
        op(Opcode::SetCurVarCreate),
        x,
        0,
        op(Opcode::SaveVarStr),
        op(Opcode::StrToNone),
    ];
    let dso = module(45, strings, code);
    assert_eq!(decompile_to_string(&dso).unwrap(), "$x = \"a\" @ $b;\n");

    let mut strings = Strings::new();
    let a = strings.add("a");
    let b = strings.add("$b");
    let x = strings.add("$x");
    // $x = "a" SPC $b;
    let code = vec![
        op(Opcode::LoadImmedStr),
        a,
        op(Opcode::AdvanceStrAppendChar),
        u32::from(b' '),
        op(Opcode::SetCurVar),
        b,
        0,
        op(Opcode::LoadVarStr),
        op(Opcode::RewindStr),
        op(Opcode::SetCurVarCreate),
        x,
        0,
        op(Opcode::SaveVarStr),
        op(Opcode::StrToNone),
    ];
    let dso = module(45, strings, code);
    assert_eq!(decompile_to_string(&dso).unwrap(), "$x = \"a\" SPC $b;\n");
}

#[test]
fn rewind_feeds_an_array_setter() {
    let mut strings = Strings::new();
    let arr = strings.add("$arr");
    let i = strings.add("$i");
    // $arr[$i] = 1;
    let code = vec![
        op(Opcode::LoadImmedIdent),
        arr,
        0,
        op(Opcode::AdvanceStr),
        op(Opcode::SetCurVar),
        i,
        0,
        op(Opcode::LoadVarStr),
        op(Opcode::RewindStr),
        op(Opcode::SetCurVarArrayCreate),
        op(Opcode::LoadImmedUint),
        1,
        op(Opcode::SaveVarUint),
        op(Opcode::UintToNone),
    ];
    let dso = module(45, strings, code);
    assert_eq!(decompile_to_string(&dso).unwrap(), "$arr[$i] = 1;\n");
}

#[test]
fn function_calls_render_by_type() {
    // echo("hi"); as a standalone statement.
    let mut strings = Strings::new();
    let echo = strings.add("echo");
    let hi = strings.add("hi");
    let code = vec![
        op(Opcode::PushFrame),
        op(Opcode::LoadImmedStr),
        hi,
        op(Opcode::Push),
        op(Opcode::CallFunc),
        echo,
        0,
        0,
        0,
        0,
        op(Opcode::StrToNone),
    ];
    let dso = module(45, strings, code);
    assert_eq!(decompile_to_string(&dso).unwrap(), "echo(\"hi\");\n");
}

#[test]
fn docblocks_and_assertions() {
    let mut strings = Strings::new();
    let note = strings.add("summary");
    let message = strings.add("boom");
    let code = vec![
        op(Opcode::DocBlockStr),
        note,
        op(Opcode::Assert),
        message,
    ];
    let dso = module(45, strings, code);
    assert_eq!(
        decompile_to_string(&dso).unwrap(),
        "///summary\nassert(\"boom\");\n"
    );
}

#[test]
fn unknown_opcodes_are_fatal() {
    let dso = module(45, Strings::new(), vec![200]);
    assert!(matches!(
        decompile_to_string(&dso),
        Err(Error::UnknownOpcode { value: 200, ip: 0 })
    ));
}

#[test]
fn backward_conditional_jumps_are_fatal() {
    let mut strings = Strings::new();
    let a = strings.add("$a");
    let code = vec![
        op(Opcode::SetCurVar),
        a,
        0,
        op(Opcode::LoadVarUint),
        op(Opcode::JmpIfNot),
        2,
    ];
    let dso = module(45, strings, code);
    assert!(matches!(
        decompile_to_string(&dso),
        Err(Error::BackwardJump { target: 2, .. })
    ));
}

#[test]
fn unimplemented_opcodes_are_fatal() {
    let dso = module(45, Strings::new(), vec![op(Opcode::Xor)]);
    assert!(matches!(
        decompile_to_string(&dso),
        Err(Error::Unimplemented { opcode: Opcode::Xor, .. })
    ));
}

#[test]
fn stack_underflow_is_fatal() {
    let dso = module(45, Strings::new(), vec![op(Opcode::Add)]);
    assert!(matches!(
        decompile_to_string(&dso),
        Err(Error::StackUnderflow { stack: Stack::Float, .. })
    ));
}

#[test]
fn container_round_trip() {
    let mut data = Vec::new();
    data.extend_from_slice(&45u32.to_le_bytes());
    let strings = b"\0hello\0world\0";
    data.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    data.extend_from_slice(strings);
    data.extend_from_slice(&0u32.to_le_bytes()); // function strings
    data.extend_from_slice(&1u32.to_le_bytes()); // global floats
    data.extend_from_slice(&2.5f64.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes()); // function floats
    data.extend_from_slice(&5u32.to_le_bytes()); // code size
    data.extend_from_slice(&0u32.to_le_bytes()); // linebreak pairs
    data.push(67); // one-byte entry
    data.push(0xFF); // wide entry prefix
    data.extend_from_slice(&300u32.to_le_bytes());
    data.push(68);
    data.push(0); // placeholder, patched below
    data.push(13);
    data.extend_from_slice(&1u32.to_le_bytes()); // patch entries
    data.extend_from_slice(&7u32.to_le_bytes()); // string offset of "world"
    data.extend_from_slice(&1u32.to_le_bytes()); // location count
    data.extend_from_slice(&3u32.to_le_bytes());

    let dso = Dso::new(&data).unwrap();
    assert_eq!(dso.version, 45);
    assert_eq!(dso.code, vec![67, 300, 68, 7, 13]);
    assert_eq!(dso.global_floats, vec![2.5]);
    assert_eq!(dso.string(7, false), "world");

    // Truncation surfaces as a read error.
    assert!(Dso::new(&data[..9]).is_err());
}

#[test]
fn container_to_script_end_to_end() {
    let mut data = Vec::new();
    data.extend_from_slice(&45u32.to_le_bytes());
    let strings = b"\0$x\0";
    data.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    data.extend_from_slice(strings);
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&7u32.to_le_bytes()); // code size
    data.extend_from_slice(&0u32.to_le_bytes());
    for value in [67u8, 42, 37, 0, 0, 43, 66] {
        data.push(value);
    }
    data.extend_from_slice(&1u32.to_le_bytes()); // patch entries
    data.extend_from_slice(&1u32.to_le_bytes()); // offset of "$x"
    data.extend_from_slice(&1u32.to_le_bytes());
    data.extend_from_slice(&3u32.to_le_bytes()); // the SetCurVarCreate operand

    let dso = Dso::new(&data).unwrap();
    assert_eq!(decompile_to_string(&dso).unwrap(), "$x = 42;\n");
}
