#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use csv::ReaderBuilder;
use ndarray::{Array1, Array2};
use serde::Deserialize;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use classo::export::load;
use classo::{
    ClassoProblem, ExportSink, FormulationConfig, HuberThreshold, LambdaChoice,
    ModelSelectionConfig, Problem, StabilityMethod, export,
};

#[derive(Clone, Copy, ValueEnum)]
pub enum StabilityMethodCli {
    First,
    Lam,
    Max,
}

impl From<StabilityMethodCli> for StabilityMethod {
    fn from(value: StabilityMethodCli) -> Self {
        match value {
            StabilityMethodCli::First => StabilityMethod::First,
            StabilityMethodCli::Lam => StabilityMethod::Lam,
            StabilityMethodCli::Max => StabilityMethod::Max,
        }
    }
}

#[derive(Args)]
pub struct FitArgs {
    /// Headerless numeric CSV with one row per observation
    #[arg(value_name = "X_CSV")]
    pub design: PathBuf,

    /// Headerless numeric CSV holding the response (one value per row)
    #[arg(value_name = "Y_CSV")]
    pub response: PathBuf,

    /// Headerless numeric CSV with one constraint row per line (default: zero-sum)
    #[arg(long, value_name = "C_CSV")]
    pub constraint: Option<PathBuf>,

    /// Column labels, comma separated
    #[arg(long, value_delimiter = ',')]
    pub labels: Option<Vec<String>>,

    /// TOML file with `[formulation]` and `[model_selection]` tables; flags override it
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Use the Huber loss
    #[arg(long)]
    pub huber: bool,

    /// Estimate the noise scale jointly with the coefficients (default for regression)
    #[arg(long, conflicts_with = "no_concomitant")]
    pub concomitant: bool,

    /// Fit with a fixed noise scale (plain least squares or Huber)
    #[arg(long)]
    pub no_concomitant: bool,

    /// Binary classification on labels in {-1, +1}
    #[arg(long)]
    pub classification: bool,

    /// Add an unpenalized intercept
    #[arg(long)]
    pub intercept: bool,

    /// Fixed Huber threshold (estimated from the data when omitted with --huber-estimate)
    #[arg(long)]
    pub rho: Option<f64>,

    /// Estimate the Huber threshold from a robust residual scale
    #[arg(long)]
    pub huber_estimate: bool,

    /// Fit at a single lambda
    #[arg(long)]
    pub lam_fixed: bool,

    /// Lambda for --lam-fixed as a fraction of lambda_max (theoretical when omitted)
    #[arg(long)]
    pub lambda: Option<f64>,

    /// Compute the regularization path
    #[arg(long)]
    pub path: bool,

    /// Select lambda by cross-validation
    #[arg(long)]
    pub cv: bool,

    /// Disable stability selection (on by default)
    #[arg(long)]
    pub no_stab_sel: bool,

    #[arg(long, value_enum)]
    pub stab_method: Option<StabilityMethodCli>,

    /// Number of stability subsamples
    #[arg(long)]
    pub subsamples: Option<usize>,

    /// Target support size for the `first` rule
    #[arg(long)]
    pub q: Option<usize>,

    /// Selection frequency threshold
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Seed for folds and subsamples
    #[arg(long)]
    pub seed: Option<u64>,

    /// Known noise standard deviation
    #[arg(long)]
    pub noise_level: Option<f64>,

    /// Directory to export the solution to
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Prefix for exported file names
    #[arg(long, default_value = "")]
    pub prefix: String,
}

#[derive(Parser)]
#[command(
    name = "classo",
    about = "Constrained Lasso regression with paths, cross-validation and stability selection",
    long_about = "Fits sparse linear models under linear equality constraints C beta = 0 \
                 (least squares, Huber, concomitant scale or classification losses) and \
                 selects the penalty by theory, cross-validation or stability selection."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve a constrained Lasso problem from CSV files
    Fit(FitArgs),

    /// Print the summary of an exported solution
    Show {
        #[arg(value_name = "SOLUTION_TOML")]
        solution: PathBuf,
    },
}

/// Contents of a `--config` file.
#[derive(Deserialize, Default)]
#[serde(default)]
struct RunConfig {
    formulation: FormulationConfig,
    model_selection: ModelSelectionConfig,
}

fn read_matrix(path: &Path) -> Result<Array2<f64>, Box<dyn Error>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| format!("failed to open csv '{}': {e}", path.display()))?;

    let mut data = Vec::new();
    let mut n_cols = None;
    let mut n_rows = 0;
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|e| format!("failed reading csv row {i}: {e}"))?;
        match n_cols {
            None => n_cols = Some(record.len()),
            Some(expected) if expected != record.len() => {
                return Err(format!(
                    "'{}' row {i} has {} fields, expected {expected}",
                    path.display(),
                    record.len()
                )
                .into());
            }
            Some(_) => {}
        }
        for field in record.iter() {
            let value: f64 = field
                .parse()
                .map_err(|e| format!("'{}' row {i}: cannot parse '{field}': {e}", path.display()))?;
            data.push(value);
        }
        n_rows += 1;
    }
    let n_cols = n_cols.ok_or_else(|| format!("'{}' is empty", path.display()))?;
    Ok(Array2::from_shape_vec((n_rows, n_cols), data)?)
}

fn read_vector(path: &Path) -> Result<Array1<f64>, Box<dyn Error>> {
    let matrix = read_matrix(path)?;
    Ok(Array1::from_iter(matrix.into_iter()))
}

fn build_configs(args: &FitArgs) -> Result<(FormulationConfig, ModelSelectionConfig), Box<dyn Error>> {
    let RunConfig {
        mut formulation,
        mut model_selection,
    } = match &args.config {
        Some(path) => toml::from_str(&fs::read_to_string(path)?)?,
        None => RunConfig::default(),
    };

    formulation.huber |= args.huber;
    if args.concomitant {
        formulation.concomitant = Some(true);
    }
    if args.no_concomitant {
        formulation.concomitant = Some(false);
    }
    formulation.classification |= args.classification;
    formulation.intercept |= args.intercept;
    if let Some(rho) = args.rho {
        formulation.rho = HuberThreshold::Fixed(rho);
    }
    if args.huber_estimate {
        formulation.rho = HuberThreshold::Estimated;
    }

    model_selection.lam_fixed |= args.lam_fixed;
    model_selection.path |= args.path;
    model_selection.cv |= args.cv;
    if args.no_stab_sel {
        model_selection.stab_sel = false;
    }
    if let Some(lambda) = args.lambda {
        model_selection.lam_fixed_parameters.lambda = LambdaChoice::Relative(lambda);
    }
    let stability = &mut model_selection.stab_sel_parameters;
    if let Some(method) = args.stab_method {
        stability.method = method.into();
    }
    if let Some(b) = args.subsamples {
        stability.b = b;
    }
    if let Some(q) = args.q {
        stability.q = q;
    }
    if let Some(threshold) = args.threshold {
        stability.threshold = threshold;
    }
    if let Some(seed) = args.seed {
        stability.seed = seed;
        model_selection.cv_parameters.seed = seed;
    }
    if args.noise_level.is_some() {
        model_selection.noise_level = args.noise_level;
    }
    Ok((formulation, model_selection))
}

fn run_fit(args: FitArgs) -> Result<(), Box<dyn Error>> {
    let x = read_matrix(&args.design)?;
    let y = read_vector(&args.response)?;
    let c = match &args.constraint {
        Some(path) => read_matrix(path)?,
        None => Array2::ones((1, x.ncols())),
    };
    let problem = Problem::new(x, y, c, args.labels.clone())?;
    let (formulation, model_selection) = build_configs(&args)?;

    let classo = ClassoProblem::new(problem)
        .with_formulation(formulation)
        .with_model_selection(model_selection);
    println!("{classo}");
    println!();

    let solution = classo.solve()?;
    println!("{solution}");

    if let Some(directory) = args.output {
        let sink = ExportSink::new(directory, args.prefix);
        let written = export(&solution, &sink)?;
        println!("Exported {} file(s) to {}", written.len(), sink.directory.display());
    }
    Ok(())
}

fn run_show(path: PathBuf) -> Result<(), Box<dyn Error>> {
    let solution = load(&path)?;
    println!("{solution}");
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Some(Commands::Fit(args)) => run_fit(args),
        Some(Commands::Show { solution }) => run_show(solution),
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
