use clap::Parser;
use faml_rust::{Error, ExprTree, ParseError, Path, Scalar};
use tracing_subscriber::EnvFilter;

use std::io::{self, Read};

/// Evaluate a FAML document read from stdin and print it as JSON.
#[derive(Parser, Debug)]
#[command(name = "faml", version)]
struct Args {
    /// Override a value before evaluation, e.g. `--set server.port=9090`.
    #[arg(long = "set", value_name = "PATH=VALUE")]
    overrides: Vec<String>,

    /// Only evaluate the subtree at this path.
    #[arg(long, default_value = "")]
    path: String,

    /// Print compact JSON instead of pretty-printed.
    #[arg(long)]
    compact: bool,

    /// Explain how the value at `--path` is computed instead of printing it.
    #[arg(long)]
    trace: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let mut input = String::new();
    if let Err(err) = io::stdin().read_to_string(&mut input) {
        eprintln!("cannot read stdin: {}", err);
        std::process::exit(1);
    }

    if let Err(err) = run(&args, &input) {
        match &err {
            Error::Parse(parse_err) => report_parse_error(&input, parse_err),
            other => eprintln!("{}", other),
        }
        std::process::exit(1);
    }
}

fn run(args: &Args, input: &str) -> Result<(), Error> {
    let mut tree = ExprTree::parse(input)?;
    for assignment in &args.overrides {
        let Some((path, literal)) = assignment.split_once('=') else {
            return Err(Error::Boundary(format!(
                "expected PATH=VALUE, got `{}`",
                assignment
            )));
        };
        tree.override_value(&Path::parse(path.trim())?, infer_scalar(literal.trim()))?;
    }

    let path = Path::parse(&args.path)?;
    if args.trace {
        println!("{}", tree.trace(&path)?);
        return Ok(());
    }

    let value = tree.evaluate(&path)?;
    let json = value.to_json();
    let text = if args.compact {
        serde_json::to_string(&json)
    } else {
        serde_json::to_string_pretty(&json)
    };
    match text {
        Ok(text) => println!("{}", text),
        Err(err) => return Err(Error::Deserialize(err.to_string())),
    }
    Ok(())
}

/// `null`, booleans and numbers are taken literally; anything else is a
/// string, with one layer of double quotes stripped.
fn infer_scalar(literal: &str) -> Scalar {
    match literal {
        "null" => return Scalar::None,
        "true" => return Scalar::Bool(true),
        "false" => return Scalar::Bool(false),
        _ => {}
    }
    if let Ok(n) = literal.parse::<i64>() {
        return Scalar::Int(n);
    }
    if let Ok(f) = literal.parse::<f64>() {
        return Scalar::Float(f);
    }
    let unquoted = literal
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(literal);
    Scalar::String(unquoted.to_string())
}

fn report_parse_error(input: &str, err: &ParseError) {
    let lines: Vec<&str> = input.lines().collect();
    let line_num = err.begin.line;
    let line_text = lines.get(line_num).unwrap_or(&"");

    eprintln!("ERROR AT LINE {}:", line_num + 1);
    eprintln!("{}", line_text);

    let start_col = err.begin.column;
    let line_len = line_text.chars().count();
    let end_col = if err.begin.line == err.end.line && err.end.column > err.begin.column {
        err.end.column
    } else if start_col < line_len {
        // Point error or multi-line span: underline to end of line
        line_len
    } else {
        start_col + 1
    };

    let mut underline = " ".repeat(start_col);
    underline.push('^');
    if end_col > start_col + 1 {
        underline.push_str(&"_".repeat(end_col - start_col - 1));
    }

    eprintln!("{}", underline);
    eprintln!("{}", err.message);
}
