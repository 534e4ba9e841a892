///
/// litefn CLI - run SQL against a connection with the built-in functions
///
/// - litefn "SELECT stdev(x) FROM t"       run one or more statements
/// - litefn --database app.db < query.sql  read SQL from stdin
/// - litefn --config litefn.toml ...       take settings from a config file
///

use clap::Parser;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use litefn::{Config, Connection, Result, SqlValue, load_config};

#[derive(Parser)]
#[command(name = "litefn")]
#[command(author, version, about = "Run SQL with host-defined functions", long_about = None)]
struct Cli {
    /// Configuration file (litefn.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Connection string or database path, overrides the config
    #[arg(long)]
    database: Option<String>,

    /// Do not register the built-in functions
    #[arg(long)]
    no_builtins: bool,

    /// SQL to run; read from stdin when omitted
    sql: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    let level = match config.log_level() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_max_level(level)
        .init();

    if let Some(database) = cli.database {
        config.connection.data_source = database;
    }
    if cli.no_builtins {
        config.functions.builtins.clear();
    }

    match run(&config, &cli.sql) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config, sql: &[String]) -> Result<()> {
    let conn = config.open()?;
    let scripts = if sql.is_empty() {
        let mut input = String::new();
        io::stdin().read_to_string(&mut input)?;
        vec![input]
    } else {
        sql.to_vec()
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for script in &scripts {
        run_script(&conn, script, &mut out)?;
    }
    conn.close()
}

fn run_script(conn: &Connection, script: &str, out: &mut impl Write) -> Result<()> {
    for statement in conn.statements(script) {
        let mut statement = statement?;
        if statement.column_count() == 0 {
            statement.execute([])?;
            continue;
        }
        writeln!(out, "{}", statement.column_names().join("\t"))?;
        for row in statement.query([])? {
            let row = row?;
            let fields: Vec<String> = row.values().iter().map(SqlValue::to_string).collect();
            writeln!(out, "{}", fields.join("\t"))?;
        }
    }
    Ok(())
}
