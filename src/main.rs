use std::fs;
use std::path::PathBuf;
use std::process;
use std::time;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;
use rand::rngs::StdRng;
use rand::SeedableRng;

use ext_sample::estimate::InputFile;
use ext_sample::output::{self, OutputSpec, SampleTarget};
use ext_sample::plan::{physical_memory_size, plan_buffer};
use ext_sample::sample::LineSampler;
use ext_sample::source::WindowedSource;
use ext_sample::LineEstimate;

fn main() {
    let matches = match build_arg_parser().try_get_matches() {
        Ok(matches) => matches,
        Err(err)
            if matches!(
                err.kind(),
                clap::ErrorKind::DisplayHelp | clap::ErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            process::exit(0);
        }
        Err(err) => {
            let _ = err.print();
            process::exit(1);
        }
    };

    let log_level: LogLevel = matches
        .value_of("log_level")
        .expect("value is defaulted")
        .parse()
        .expect("value is pre-validated");
    init_logger(log_level);

    let force = matches.is_present("force");
    let quick = matches.is_present("quick");
    let shuffle = matches.is_present("shuffle");
    let interleave = match matches.value_of("interleave") {
        Some(value) => match value.trim().parse::<u64>() {
            Ok(factor) => factor,
            Err(_) => fail(&format!("invalid interleaving factor `{}'", value)),
        },
        None => 0,
    };

    let input_paths: Vec<PathBuf> = matches
        .values_of("input")
        .expect("value is required")
        .map(PathBuf::from)
        .collect();

    let mut specs = match collect_output_specs(&matches) {
        Ok(specs) => specs,
        Err(message) => fail(&message),
    };

    if let Err(message) = validate_modes(quick, shuffle, interleave, input_paths.len(), &specs) {
        fail(&message);
    }

    if let Err(message) = check_input_files(&input_paths) {
        fail(&message);
    }
    if !force {
        if let Err(message) = check_output_files(&specs) {
            fail(&message);
        }
    }

    let started = time::Instant::now();

    let inputs: Vec<InputFile> = match input_paths.iter().map(|path| InputFile::stat(path)).collect() {
        Ok(inputs) => inputs,
        Err(err) => fail(&format!("input file inspection failed: {}", err)),
    };

    let mut rng = StdRng::from_entropy();
    let sampler = LineSampler::new(WindowedSource::default());

    let result = if quick {
        if specs
            .iter()
            .any(|spec| matches!(spec.target, SampleTarget::Rate(rate) if rate < 1.0))
        {
            log::info!("rate targets present, estimating the total line count");
            let total = guess_total_lines(&inputs);
            normalize_to_counts(&mut specs, total);
        }
        sampler.quick_sample(&inputs[0], &specs, &mut rng)
    } else if shuffle {
        if specs.iter().any(|spec| spec.target.count().is_some()) {
            log::info!("count targets present, estimating the total line count");
            let total = guess_total_lines(&inputs);
            normalize_to_rates(&mut specs, total);
        }

        let total_bytes = inputs.iter().map(|input| input.size).sum();
        let plan = plan_buffer(total_bytes, physical_memory_size(), interleave);
        log::info!(
            "shuffle plan: {} pass(es), {} of staging budget",
            plan.interleave,
            ByteSize(plan.budget)
        );
        sampler.shuffle(&inputs, &specs, plan, &mut rng)
    } else {
        if specs.iter().any(|spec| spec.target.count().is_some()) {
            log::info!("count targets present, estimating the total line count");
            let total = guess_total_lines(&inputs);
            normalize_to_rates(&mut specs, total);
        }
        sampler.sample(&inputs, &specs, &mut rng)
    };

    match result {
        Ok(written) => {
            log::info!(
                "done in {:.2?}, {} lines written in total",
                started.elapsed(),
                written.iter().sum::<u64>()
            );
        }
        Err(err) => {
            log::error!("{}", err);
            process::exit(1);
        }
    }
}

fn fail(message: &str) -> ! {
    log::error!("{}", message);
    process::exit(1);
}

/// Collects per-output specs from the `-o`, `-n` and `-r` occurrences and
/// prints the target diagnostics.
fn collect_output_specs(matches: &clap::ArgMatches) -> Result<Vec<OutputSpec>, String> {
    let mut specs = Vec::new();

    if let Some(values) = matches.values_of("all") {
        let paths: Vec<&str> = values.collect();
        if paths.len() > 1 {
            return Err("only one output may take all lines".into());
        }
        for path in paths {
            println!("{}\tTargetRate\t{}", path, 1.0);
            specs.push(OutputSpec::new(path, SampleTarget::All));
        }
    }

    if let Some(values) = matches.values_of("count") {
        let values: Vec<&str> = values.collect();
        for pair in values.chunks(2) {
            let count = output::parse_count(pair[0])?;
            println!("{}\tTargetLineCount\t{}", pair[1], count);
            specs.push(OutputSpec::new(pair[1], SampleTarget::Count(count)));
        }
    }

    if let Some(values) = matches.values_of("rate") {
        let values: Vec<&str> = values.collect();
        for pair in values.chunks(2) {
            let rate = output::parse_rate(pair[0])?;
            println!("{}\tTargetRate\t{}", pair[1], rate);
            specs.push(OutputSpec::new(pair[1], SampleTarget::Rate(rate)));
        }
    }

    if specs.is_empty() {
        return Err("no output files".into());
    }

    return Ok(specs);
}

/// Rejects conflicting mode flags before any file is touched.
fn validate_modes(
    quick: bool,
    shuffle: bool,
    interleave: u64,
    input_count: usize,
    specs: &[OutputSpec],
) -> Result<(), String> {
    if interleave > 0 && !shuffle {
        return Err("an interleaving factor is allowed only in shuffle mode".into());
    }

    if quick {
        if shuffle {
            return Err(
                "shuffle mode is redundant in quick mode, which already shuffles its outputs".into(),
            );
        }
        if input_count != 1 {
            return Err("quick mode takes exactly one input file".into());
        }
        if specs.iter().any(|spec| spec.target.is_all()) {
            return Err("sampling all lines defeats the purpose of quick mode".into());
        }
    }

    return Ok(());
}

fn check_input_files(paths: &[PathBuf]) -> Result<(), String> {
    for path in paths {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(format!("input {} is not a regular file", path.display())),
            Err(_) => return Err(format!("input file {} does not exist", path.display())),
        }
    }
    return Ok(());
}

fn check_output_files(specs: &[OutputSpec]) -> Result<(), String> {
    for spec in specs {
        if spec.path.exists() {
            return Err(format!(
                "output file {} already exists (use -f to overwrite)",
                spec.path.display()
            ));
        }
    }
    return Ok(());
}

/// Sums the per-file line estimates, printing each one.
fn guess_total_lines(inputs: &[InputFile]) -> f64 {
    let mut total = 0.0;
    for input in inputs {
        let estimated = input.estimated_lines();
        match input.lines {
            LineEstimate::Exact(count) => {
                println!("{}\tEstLineCount\t{}", input.path.display(), count)
            }
            LineEstimate::Approximate { .. } => {
                println!("{}\tEstLineCount\t{}", input.path.display(), estimated)
            }
        }
        total += estimated;
    }
    return total;
}

/// Rewrites every count target as a rate, printing the resolved rates.
fn normalize_to_rates(specs: &mut [OutputSpec], total_lines: f64) {
    for spec in specs.iter_mut() {
        if spec.target.count().is_some() {
            spec.target = spec.target.clone().into_rate(total_lines);
            if let Some(rate) = spec.target.rate() {
                println!("{}\tRate\t{}", spec.path.display(), rate);
            }
        }
    }
}

/// Rewrites every fractional rate target as an absolute count, printing the
/// resolved counts.
fn normalize_to_counts(specs: &mut [OutputSpec], total_lines: f64) {
    for spec in specs.iter_mut() {
        if matches!(spec.target, SampleTarget::Rate(rate) if rate < 1.0) {
            spec.target = spec.target.clone().into_count(total_lines);
            if let Some(count) = spec.target.count() {
                println!("{}\tNumberOfLines\t{}", spec.path.display(), count);
            }
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::App<'static> {
    clap::App::new("ext-sample")
        .about("out-of-core line sampler and shuffler for large text files")
        .override_usage("ext-sample [OPTIONS] <INPUTFILE>... [-o FILE | -n LINES FILE | -r RATE FILE]...")
        .arg(
            clap::Arg::new("interleave")
                .short('c')
                .help("shuffle with N interleaved passes (0 picks the pass count automatically)")
                .takes_value(true)
                .value_name("N"),
        )
        .arg(
            clap::Arg::new("force")
                .short('f')
                .help("force overwrite of existing output files"),
        )
        .arg(
            clap::Arg::new("quick")
                .short('q')
                .help("quick mode: one fast approximate pass over a single input"),
        )
        .arg(
            clap::Arg::new("shuffle")
                .short('s')
                .help("shuffle output lines"),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("all")
                .short('o')
                .help("write all lines to FILE")
                .takes_value(true)
                .value_name("FILE")
                .multiple_occurrences(true),
        )
        .arg(
            clap::Arg::new("count")
                .short('n')
                .help("sample around LINES lines into FILE")
                .takes_value(true)
                .value_names(&["LINES", "FILE"])
                .number_of_values(2)
                .multiple_occurrences(true),
        )
        .arg(
            clap::Arg::new("rate")
                .short('r')
                .help("sample at RATE, a probability in (0,1] or a percent in (0,100] with `%'")
                .takes_value(true)
                .value_names(&["RATE", "FILE"])
                .number_of_values(2)
                .multiple_occurrences(true),
        )
        .arg(
            clap::Arg::new("input")
                .help("input file")
                .value_name("INPUTFILE")
                .takes_value(true)
                .multiple_values(true)
                .required(true),
        )
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
