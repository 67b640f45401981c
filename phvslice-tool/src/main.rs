use std::path::PathBuf;

use clap::Parser;
use phvslice::{
    action::solve,
    checker::{check_instruction, check_slicing},
    serialize::{Problem, SerializableAction, SerializableProblem},
    SlicingIterator, Solution,
};

#[derive(Parser)]
/// Tool for replaying phvslice problems.
struct Args {
    /// Print the input problem and every result.
    #[clap(short = 'v')]
    verbose: bool,

    /// Stop after this many slicing solutions.
    #[clap(short = 'n', long, default_value_t = 1)]
    max_solutions: usize,

    /// Input file containing a bincode-encoded Problem.
    input: PathBuf,
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    let input = std::fs::read(&args.input).expect("could not read input file");
    let problem: Problem = bincode::deserialize(&input).expect("could not deserialize input file");

    match problem {
        Problem::Slicing(p) => run_slicing(&args, &p),
        Problem::Action(a) => run_action(&args, &a),
    }
}

fn run_slicing(args: &Args, problem: &SerializableProblem) {
    let sc = problem
        .super_cluster()
        .unwrap_or_else(|e| panic!("ill-formed super-cluster: {e}"));
    if args.verbose {
        println!("Program: {:?}", problem.program());
        println!("Input: {sc:?}");
    }

    let mut options = *problem.options();
    options.verbose_log = args.verbose;
    let mut it = match SlicingIterator::new(problem.program(), sc.clone(), options) {
        Ok(it) => it,
        Err(e) => panic!("Slicing failed to start: {e}"),
    };

    let mut count = 0;
    it.for_each_solution(|solution| {
        count += 1;
        if args.verbose {
            print_solution(count, solution);
        }
        if let Err(e) = check_slicing(problem.program(), &sc, &solution.clusters) {
            panic!("Slicing checker failed on solution {count}: {e}");
        }
        count < args.max_solutions
    });

    println!("{count} solution(s); {:?}", it.stats());
    if count == 0 {
        match it.last_failure() {
            Some(failure) => println!("last packing failure: {failure}"),
            None => println!("no packing failure recorded"),
        }
    }
}

fn run_action(args: &Args, action: &SerializableAction) {
    if args.verbose {
        println!("Destination: {} live {:?}", action.spec.container, action.spec.live);
        for assign in &action.assigns {
            println!("  {assign:?}");
        }
    }
    match solve(&action.spec, &action.assigns, &action.options) {
        Ok(instr) => {
            println!("{instr}");
            if let Err(e) = check_instruction(&action.spec, &action.assigns, &instr) {
                panic!("Instruction checker failed: {e}");
            }
        }
        Err(e) => println!("no instruction: {e}"),
    }
}

fn print_solution(index: usize, solution: &Solution) {
    print!("Solution {index}: {{\n");
    for sc in &solution.clusters {
        for list in sc.lists() {
            print!("  {:?} ({} bits)\n", list, list.width());
        }
    }
    for (slice, constraint) in &solution.constraints {
        print!("  {slice}: {constraint}\n");
    }
    print!("}}\n");
}
