use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, ValueEnum};

use tessel::types;
use tessel::{
    BlockId, Member, RunOutcome, Signature, Stack, StackCreateInfo, Value, World,
    WorldCreateInfo, state,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Demo {
    /// Sum a list with a counted loop
    Sum,
    /// Bump a counter kept in the persistent state tree
    Counter,
    /// Send the same message to records of two types
    Dispatch,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long, value_enum, default_value = "sum", help = "Program to run")]
    demo: Demo,

    /// Print the compiled bytecode before running
    #[arg(long, help = "Dump bytecode + pools of every compiled block")]
    disassemble: bool,

    /// Load state from and save it back to this JSON file
    #[arg(long, help = "State file for the counter demo")]
    state_file: Option<PathBuf>,

    #[arg(long, help = "Resolve every send through the slow path")]
    no_inline_cache: bool,

    #[arg(long, default_value_t = 1, help = "How many times to run the program")]
    iterations: usize,
}

fn sum_demo(world: &World) -> (BlockId, Vec<Value>) {
    let sum = world.add_block(
        Signature::new("sum")
            .input("items", types::list())
            .output("total", types::int(), 2)
            .locals(4),
        |_, p| {
            p.node(1);
            p.load_int(1, 0);
            p.load_int(2, 0);
            let top = p.current_offset();
            p.node(2);
            let done = p.jump_if_done(1, 0);
            p.get_index(3, 0, 1);
            p.add_int(2, 2, 3);
            p.increment(1);
            p.jump_back(top);
            p.bind(done);
            p.node(3);
            p.return_();
            Ok(())
        },
    );
    let items = Value::list((1..=10).map(Value::Int).collect());
    (sum, vec![items])
}

fn counter_demo(world: &World) -> (BlockId, Vec<Value>) {
    let tick = world.add_block(
        Signature::new("tick").output("count", types::int(), 0).locals(3),
        |_, p| {
            p.get_state(0, "count")?;
            p.set_null(1);
            p.equals(2, 0, 1);
            let seen = p.jump_if_not(2);
            p.load_int(0, 0);
            p.bind(seen);
            p.increment(0);
            p.save_state("count", 0)?;
            p.return_();
            Ok(())
        },
    );
    let main = world.add_block(
        Signature::new("main")
            .output("ticks", types::int(), 1)
            .locals(2),
        move |_, p| {
            p.load(0, Value::str("tick"))?;
            p.call_keyed(tick, 0, 0, 1, 0)?;
            p.return_();
            Ok(())
        },
    );
    (main, vec![])
}

fn dispatch_demo(world: &World) -> (BlockId, Vec<Value>) {
    let circle = world.define_record("Circle", &[("r", types::float())]);
    let square = world.define_record("Square", &[("side", types::float())]);

    let circle_area = world.add_block(
        Signature::new("Circle.area")
            .input("self", types::any())
            .output("area", types::float(), 3)
            .locals(4),
        |_, p| {
            p.load_int(1, 0);
            p.get_index(2, 0, 1);
            p.mul_float(3, 2, 2);
            p.load(2, Value::Float(std::f64::consts::PI))?;
            p.mul_float(3, 3, 2);
            p.return_();
            Ok(())
        },
    );
    let square_area = world.add_block(
        Signature::new("Square.area")
            .input("self", types::any())
            .output("area", types::float(), 2)
            .locals(3),
        |_, p| {
            p.load_int(1, 0);
            p.get_index(2, 0, 1);
            p.mul_float(2, 2, 2);
            p.return_();
            Ok(())
        },
    );
    world.add_method(circle.id, "area", circle_area);
    world.add_method(square.id, "area", square_area);

    let print = world.add_native_block(
        Signature::new("print")
            .input("value", types::any())
            .variadic(),
        "print",
    );
    let shapes = world.create_module("shapes", [("print", Member::Function(print))]);

    let main = world.add_block(
        Signature::new("areas")
            .input("shapes", types::list())
            .input("io", types::any())
            .output("total", types::float(), 2)
            .locals(6),
        |_, p| {
            p.load(2, Value::Float(0.0))?;
            p.load_int(3, 0);
            let top = p.current_offset();
            let done = p.jump_if_done(3, 0);
            p.get_index(4, 0, 3);
            p.send("area", 4, 1, 5)?;
            p.add_float(2, 2, 5);
            p.copy(4, 1);
            p.send("print", 4, 2, 5)?;
            p.increment(3);
            p.jump_back(top);
            p.bind(done);
            p.return_();
            Ok(())
        },
    );

    let mut items = Vec::new();
    for i in 1..=6 {
        let (ty, size) = if i % 2 == 0 { (&square, i as f64) } else { (&circle, i as f64 / 2.0) };
        match ty.cast(&Value::list(vec![Value::Float(size)])) {
            Ok(shape) => items.push(shape),
            Err(err) => log::error!("building demo shape: {err}"),
        }
    }
    (main, vec![Value::list(items), shapes])
}

fn disassemble(world: &World) {
    for id in 0..world.block_count() {
        let id = BlockId(id as u32);
        let program = world
            .compile_block(id)
            .and_then(|index| world.program(index));
        match program {
            Ok(program) => {
                println!("== {} {} ==", id, program.name());
                print!("{}", program.disassemble());
            }
            Err(err) => eprintln!("{id}: {err}"),
        }
    }
}

fn run(stack: &mut Stack, block: BlockId, inputs: Vec<Value>) -> Option<Vec<Value>> {
    if let Err(err) = stack.push_frame(block, inputs) {
        eprintln!("Error: {err}");
        return None;
    }
    loop {
        match stack.run() {
            Ok(RunOutcome::Finished) => {
                let outputs = stack.outputs();
                stack.reset(tessel::ResetPolicy::KeepState);
                return Some(outputs);
            }
            Ok(RunOutcome::Paused) => continue,
            Ok(RunOutcome::Cancelled) => return None,
            Err(err) => {
                if let Some(info) = stack.error() {
                    eprintln!(
                        "Error in frame {} at pc {}: {err}",
                        info.frame, info.pc.offset
                    );
                }
                return None;
            }
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let world: Arc<World> = World::new(WorldCreateInfo::default());
    let (block, inputs) = match cli.demo {
        Demo::Sum => sum_demo(&world),
        Demo::Counter => counter_demo(&world),
        Demo::Dispatch => dispatch_demo(&world),
    };

    if cli.disassemble {
        disassemble(&world);
    }

    let mut stack = Stack::new(
        world.clone(),
        StackCreateInfo {
            inline_cache: !cli.no_inline_cache,
            ..Default::default()
        },
    );

    if let Some(path) = cli.state_file.as_ref().filter(|path| path.exists()) {
        match state::load_file(&world, path) {
            Ok(tree) => stack.set_state(tree),
            Err(err) => {
                eprintln!("Error reading state file '{}': {err}", path.display());
                process::exit(1);
            }
        }
    }

    for _ in 0..cli.iterations {
        match run(&mut stack, block, inputs.clone()) {
            Some(outputs) => {
                let outputs: Vec<String> = outputs.iter().map(Value::to_string).collect();
                println!("{}", outputs.join(" "));
            }
            None => process::exit(1),
        }
    }

    let stats = stack.cache_stats();
    log::info!("inline cache: {} hits, {} misses", stats.hits, stats.misses);

    if let Some(path) = &cli.state_file {
        if let Err(err) = state::save_file(path, stack.state()) {
            eprintln!("Error writing state file '{}': {err}", path.display());
            process::exit(1);
        }
    }
}
