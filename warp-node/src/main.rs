//! Demo runner: build a tiny program with the function builder, run it
//! on a two-node fleet, then migrate the root thread mid-run.

use warp_node::{install_const, install_function, publish_control_block, Fleet};
use warp_object::ident::Vpid;
use warp_object::interp::{FuncBuilder, Opcode, TYPE_I32, TYPE_U8};
use warp_object::memory::VAddr;
use warp_object::task::ThreadStatus;

fn main() {
    env_logger::init();
    let nodes: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(2);

    let mut fleet = Fleet::new(nodes.max(2));
    let pid = Vpid::new("demo");
    let master = fleet.node(0).nid();
    let vm = fleet.node(0).host_vm(&pid, master);

    // Shared cells: two addends, a go-flag the demo flips once the
    // thread has warped, a zero to compare against, and a pointer cell
    // for the load.
    let c5 = install_const(&vm, &5i32.to_le_bytes()).expect("const");
    let c7 = install_const(&vm, &7i32.to_le_bytes()).expect("const");
    let flag = install_const(&vm, &[0u8]).expect("flag");
    let zero = install_const(&vm, &[0u8]).expect("zero");
    let flag_ptr = install_const(&vm, &flag.0.to_le_bytes()).expect("flag ptr");

    // main: sum = *c5 + *c7; while *flag == 0 {}; return sum
    let mut b = FuncBuilder::new("main");
    let sum = b.slot(TYPE_I32);
    let flag_val = b.slot(TYPE_U8);
    let still_zero = b.slot(TYPE_U8);
    let spin = b.new_block();
    let done = b.new_block();
    b.push(Opcode::Add, TYPE_I32, sum, &[c5.0, c7.0]);
    b.push(Opcode::Br, VAddr::NON, VAddr::NON, &[spin as u64]);
    b.select(spin);
    b.push(Opcode::Load, TYPE_U8, flag_val, &[flag_ptr.0]);
    b.push(Opcode::Eq, TYPE_U8, still_zero, &[flag_val.0, zero.0]);
    b.push(
        Opcode::BrCond,
        VAddr::NON,
        VAddr::NON,
        &[still_zero.0, spin as u64, done as u64],
    );
    b.select(done);
    b.push(Opcode::Ret, TYPE_I32, VAddr::NON, &[sum.0]);

    let func = install_function(&vm, &b.encode()).expect("install function");
    let (pcb, _result) = publish_control_block(&vm, func).expect("publish pcb");
    fleet.node(0).activate(&pid, 1, pcb, master);

    // Let the program start spinning, then warp it to the second node.
    fleet.run_steps(20);
    let dst = fleet.node(1).nid();
    fleet.node(1).host_vm(&pid, master);
    let _completion = vm.request_warp(1, dst).expect("request warp");
    fleet.run_steps(200);

    let remote = fleet.node(1).vm(&pid).expect("vm on destination");
    let warped = remote
        .process()
        .thread(1)
        .map(|t| t.status() == ThreadStatus::Normal)
        .unwrap_or(false);
    println!("thread warped to second node: {}", warped);

    // Release the spin loop and wait for the exit code.
    vm.process()
        .accessor()
        .write::<u8>(flag, 1)
        .expect("release flag");
    fleet.run();

    // The control block may still be in flight to the second node; the
    // exit code read follows the same fault contract as everything else.
    for _ in 0..10 {
        match remote.exit_code() {
            Ok(code) => {
                println!("process finished with exit code {}", code);
                return;
            }
            Err(_) => fleet.run(),
        }
    }
    println!("process did not finish");
}
