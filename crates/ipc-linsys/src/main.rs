use std::process::ExitCode;

use ipc_linsys::{AmgSolver, BlockValue, LinSysError, SolveDiagnostics, SolverParams};
use nalgebra::{Matrix2, Matrix3};
use tracing_subscriber::EnvFilter;

fn usage() {
    eprintln!("usage: ipc-linsys solve <system.mtx> [params.json] [block-size 1|2|3]");
    eprintln!("       ipc-linsys params");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_summary(dofs: usize, nnz: usize, diagnostics: Option<&SolveDiagnostics>) {
    println!("dofs: {dofs}");
    println!("nnz: {nnz}");
    if let Some(d) = diagnostics {
        println!("iterations: {}", d.iterations);
        println!("residual: {:e}", d.residual);
        println!("converged: {}", d.converged);
        println!("solver: {}", d.solver_name);
        println!("elapsed_ms: {:.3}", d.elapsed.as_secs_f64() * 1e3);
    }
}

fn solve<V: BlockValue>(system: &str, params: SolverParams) -> Result<(), LinSysError> {
    let mut solver = AmgSolver::<V>::new(params)?;
    let rhs = solver.load(system)?;
    solver.analyze_pattern()?;
    solver.factorize()?;
    let result = solver.solve(&rhs);

    let nnz = solver.matrix().map_or(0, |m| m.nnz());
    print_summary(solver.num_dofs(), nnz, solver.diagnostics());
    result.map(|_| ())
}

fn run_solve(args: &[String]) -> ExitCode {
    let Some(system) = args.first() else {
        usage();
        return ExitCode::from(2);
    };
    let params = match args.get(1) {
        Some(path) => match SolverParams::from_json_file(path) {
            Ok(params) => params,
            Err(err) => {
                eprintln!("config error: {err}");
                return ExitCode::from(1);
            }
        },
        None => SolverParams::default(),
    };

    let result = match args.get(2).map(String::as_str) {
        None | Some("1") => solve::<f64>(system, params),
        Some("2") => solve::<Matrix2<f64>>(system, params),
        Some("3") => solve::<Matrix3<f64>>(system, params),
        Some(other) => {
            eprintln!("unsupported block size: {other}");
            usage();
            return ExitCode::from(2);
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("solve error: {err}");
            ExitCode::from(1)
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("solve") if (3..=5).contains(&args.len()) => run_solve(&args[2..]),
        Some("params") if args.len() == 2 => match SolverParams::default().to_json_string() {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("config error: {err}");
                ExitCode::from(1)
            }
        },
        _ => {
            usage();
            ExitCode::from(2)
        }
    }
}
