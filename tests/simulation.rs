use sim86::{
    decode_all, estimate_cycles, step, ExecError, Executor, ExecutorConfig, MachineState, Register,
};

fn load(bytes: &[u8]) -> (MachineState, sim86::Program) {
    let program = decode_all(bytes).unwrap();
    let mut state = MachineState::new();
    state.load_program(bytes).unwrap();
    (state, program)
}

#[test]
fn register_to_register_mov() {
    let (mut state, program) = load(&[0x89, 0xd9]);
    let instruction = program.get(0).unwrap().clone();
    assert_eq!(instruction.to_string(), "mov cx, bx");
    assert_eq!(instruction.size, 2);

    state.registers.set_word(Register::B, 0x55);
    let trace = step(&mut state, &program).unwrap();
    assert_eq!(state.registers.word(Register::C), 0x55);
    assert_eq!(estimate_cycles(&state, &instruction, trace.branch_taken), 2);
}

#[test]
fn immediate_to_register_mov() {
    let (mut state, program) = load(&[0xbb, 0x0a, 0x00]);
    let instruction = program.get(0).unwrap().clone();
    assert_eq!(instruction.to_string(), "mov bx, 10");
    assert_eq!(instruction.size, 3);

    step(&mut state, &program).unwrap();
    assert_eq!(state.registers.word(Register::B), 10);
    assert_eq!(state.ip, 3);
    assert_eq!(estimate_cycles(&state, &instruction, false), 4);
}

#[test]
fn taken_jne_to_itself_keeps_ip() {
    let (mut state, program) = load(&[0x75, 0xfe]);
    assert!(!state.flags.zero);
    let trace = step(&mut state, &program).unwrap();
    assert!(trace.branch_taken);
    assert_eq!(state.ip, 0);
}

#[test]
fn push_then_pop_restores_value_and_sp() {
    // mov sp, 0x100 ; mov ax, 0x1234 ; push ax ; pop bx
    let (state, program) = load(&[0xbc, 0x00, 0x01, 0xb8, 0x34, 0x12, 0x50, 0x5b]);
    let mut executor = Executor::new(program, state, ExecutorConfig::default());
    executor.run(|_| {}).unwrap();

    let state = executor.state();
    assert_eq!(state.registers.word(Register::B), 0x1234);
    assert_eq!(state.sp(), 0x100);
}

#[test]
fn odd_word_store_pays_transfer_penalty() {
    // mov word [bx], 7
    let (_, program) = load(&[0xc7, 0x07, 0x07, 0x00]);
    let instruction = program.get(0).unwrap();

    let mut even = MachineState::new();
    even.registers.set_word(Register::B, 1000);
    let mut odd = MachineState::new();
    odd.registers.set_word(Register::B, 1001);

    let even_cycles = estimate_cycles(&even, instruction, false);
    let odd_cycles = estimate_cycles(&odd, instruction, false);
    assert_eq!(even_cycles, 15);
    assert_eq!(odd_cycles, even_cycles + 4);
}

#[test]
fn program_runs_to_completion_with_cycles() {
    // mov cx, 5 ; mov bx, 1000 ; l: mov [bx], cx ; add bx, 2 ; sub cx, 1 ; jne l
    let bytes = [
        0xb9, 0x05, 0x00, 0xbb, 0xe8, 0x03, 0x89, 0x0f, 0x83, 0xc3, 0x02, 0x83, 0xe9, 0x01,
        0x75, 0xf6,
    ];
    let (state, program) = load(&bytes);
    let config = ExecutorConfig {
        estimate_cycles: true,
    };
    let mut executor = Executor::new(program, state, config);
    let mut lines = Vec::new();
    let summary = executor.run(|trace| lines.push(trace.to_string())).unwrap();

    assert_eq!(summary.steps, 2 + 5 * 4);
    assert_eq!(lines[2], "mov [bx], cx ; [0x3e8]:0x0->0x5 ip:0x6->0x8");
    assert!(summary.total_cycles > 0);

    let state = executor.state();
    for (i, expected) in (1..=5u16).rev().enumerate() {
        let address = 1000 + 2 * i;
        let word = u16::from_le_bytes([state.memory()[address], state.memory()[address + 1]]);
        assert_eq!(word, expected);
    }
    assert_eq!(state.registers.word(Register::B), 1010);
    assert!(state.flags.zero);
    assert_eq!(state.ip as usize, bytes.len());
}

#[test]
fn failed_run_leaves_state_inspectable() {
    // mov ax, 1 ; ret
    let (state, program) = load(&[0xb8, 0x01, 0x00, 0xc3]);
    let state = state.with_stack_sentinel(0);
    let mut executor = Executor::new(program, state, ExecutorConfig::default());
    let err = executor.run(|_| {}).unwrap_err();

    assert_eq!(err, ExecError::StackUnderflow { ip: 3, sp: 0 });
    assert_eq!(executor.state().registers.word(Register::A), 1);
    assert_eq!(executor.state().ip, 3);
}
