use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use graphop_kernel::test_harness::{run_simulator, SimulatorConfig, TestHarness, WorldFile};
use graphop_kernel::{logging, Actor, Engine, EngineConfig, OperationRequest, StaticVoter, StepContext};
use std::path::PathBuf;

fn cli() -> Command {
    Command::new("graphop")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Plan and run bulk operations on object graphs")
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Write logs as JSON lines"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("run")
                .about("Run one operation request against a world file")
                .arg(
                    Arg::new("world")
                        .long("world")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("World file: schema plus objects, JSON"),
                )
                .arg(
                    Arg::new("request")
                        .long("request")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Operation request, JSON"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Engine configuration, TOML"),
                )
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Plan and check permissions without writing"),
                )
                .arg(
                    Arg::new("user")
                        .long("user")
                        .default_value("1")
                        .value_parser(value_parser!(u64))
                        .help("Acting user"),
                )
                .arg(
                    Arg::new("group")
                        .long("group")
                        .default_value("1")
                        .value_parser(value_parser!(u64))
                        .help("Acting group"),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run random operations on random worlds and check invariants")
                .arg(
                    Arg::new("worlds")
                        .long("worlds")
                        .default_value("200")
                        .value_parser(value_parser!(u64))
                        .help("Number of worlds, one operation each"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("max-images")
                        .long("max-images")
                        .default_value("6")
                        .value_parser(value_parser!(usize))
                        .help("Largest number of images per world"),
                )
                .arg(
                    Arg::new("keep-going")
                        .long("keep-going")
                        .action(ArgAction::SetTrue)
                        .help("Continue after the first violation"),
                ),
        )
        .subcommand(Command::new("certify").about("Run the simulator over ten seeds"))
}

fn run(args: &ArgMatches) -> Result<()> {
    let world_path = args.get_one::<PathBuf>("world").context("--world is required")?;
    let request_path = args.get_one::<PathBuf>("request").context("--request is required")?;
    let user = args.get_one::<u64>("user").copied().unwrap_or(1);
    let group = args.get_one::<u64>("group").copied().unwrap_or(1);

    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let mut world = WorldFile::load(world_path)?.build()?;
    let text = std::fs::read_to_string(request_path)
        .with_context(|| format!("reading {}", request_path.display()))?;
    let mut request: OperationRequest =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", request_path.display()))?;
    if args.get_flag("dry-run") {
        request.dry_run = true;
    }

    let engine = Engine::new(world.schema.clone(), &config, Box::new(StaticVoter::allow_all()))?;
    let mut ctx = StepContext::new(&mut world.store).with_files(&mut world.files);
    let response = engine.run(&request, Actor::user(user, group), &mut ctx)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn simulate(args: &ArgMatches) -> Result<()> {
    let config = SimulatorConfig {
        seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
        worlds: args.get_one::<u64>("worlds").copied().unwrap_or(200),
        max_images: args.get_one::<usize>("max-images").copied().unwrap_or(6),
        stop_on_first_violation: !args.get_flag("keep-going"),
        ..SimulatorConfig::default()
    };
    let report = run_simulator(config);
    println!("{}", report.generate_text());
    if !report.passed() {
        bail!("{} invariant violations", report.violations.len());
    }
    Ok(())
}

fn certify() -> Result<()> {
    let report = TestHarness::run_certification();
    println!("Seeds: {}", report.seeds_tested);
    println!("Violations: {}", report.total_violations);
    println!("Result: {}", if report.passed { "PASS" } else { "FAIL" });
    if !report.passed {
        bail!("certification failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let matches = cli().get_matches();
    logging::init(matches.get_flag("json-logs"));

    match matches.subcommand() {
        Some(("run", args)) => run(args),
        Some(("simulate", args)) => simulate(args),
        Some(("certify", _)) => certify(),
        _ => Ok(()),
    }
}
