use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use partidx::core::Document;
use partidx::{IndexConfig, PartitionedIndex};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "partidx", version, about = "Partitioned index maintenance tool")]
struct Cli {
    /// TOML 配置文件
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// 覆盖配置中的索引根目录
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prepare the index root and the first partition folder
    Create,
    /// Exit 0 when every partition holds a committed index
    Exists,
    /// Run the consistency check on a closed index
    Validate,
    /// Print per-partition generations, documents and searchers
    Stats,
    /// Append a new empty partition
    AddPartition,
    /// Add one document to a partition and commit it
    Put(PutArgs),
    /// Print every visible document as JSON lines
    Dump,
    /// List the files of the current commit point of every partition
    Snapshot,
    /// Close the index and delete its root folder
    Drop,
}

#[derive(Args)]
struct PutArgs {
    #[arg(long)]
    id: u64,
    /// key=value，可重复
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, String)>,
    /// 目标分区序号（从 1 开始），默认最后一个
    #[arg(long)]
    partition: Option<usize>,
}

fn parse_field(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {s:?}")),
    }
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };
    std::process::exit(exit_code);
}

fn load_config(cli: &Cli) -> Result<IndexConfig> {
    let mut config = match &cli.config {
        Some(path) => IndexConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => IndexConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    Ok(config)
}

fn init_tracing(config: &IndexConfig) {
    // RUST_LOG 优先于配置文件
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli)?;
    init_tracing(&config);
    info!("partidx index root: {}", config.root.display());

    let index = PartitionedIndex::from_config(&config);
    match cli.command {
        Command::Create => {
            index.create()?;
            println!("created {}", config.root.display());
            Ok(0)
        }
        Command::Exists => {
            let exists = index.exists()?;
            println!("{exists}");
            Ok(if exists { 0 } else { 1 })
        }
        Command::Validate => {
            let valid = index.is_valid();
            println!("{}", if valid { "valid" } else { "invalid" });
            Ok(if valid { 0 } else { 1 })
        }
        Command::Stats => {
            index.open()?;
            index.maybe_refresh_blocking()?;
            print!("{}", index.stats());
            index.close()?;
            Ok(0)
        }
        Command::AddPartition => {
            index.open()?;
            let partition = index.add_new_partition()?;
            println!("{}", partition.folder().display());
            index.close()?;
            Ok(0)
        }
        Command::Put(args) => {
            index.open()?;
            let result = put(&index, args);
            index.close()?;
            result
        }
        Command::Dump => {
            index.open()?;
            index.maybe_refresh_blocking()?;
            let reader = index.all_documents_reader()?;
            for doc in &reader {
                println!("{}", serde_json::to_string(doc)?);
            }
            reader.close();
            index.close()?;
            Ok(0)
        }
        Command::Snapshot => {
            index.open()?;
            let mut snapshot = index.snapshot()?;
            for file in snapshot.by_ref() {
                println!("{}", file.display());
            }
            snapshot.close()?;
            index.close()?;
            Ok(0)
        }
        Command::Drop => {
            index.drop_index()?;
            println!("dropped {}", config.root.display());
            Ok(0)
        }
    }
}

fn put(index: &PartitionedIndex, args: PutArgs) -> Result<i32> {
    let partitions = index.partitions()?;
    let partition = match args.partition {
        Some(n) if n >= 1 && n <= partitions.len() => partitions[n - 1].clone(),
        Some(n) => bail!("partition {n} does not exist ({} partitions)", partitions.len()),
        None => match partitions.last() {
            Some(p) => p.clone(),
            None => index.add_new_partition()?,
        },
    };

    let mut doc = Document::new(args.id);
    for (k, v) in args.fields {
        doc = doc.with_field(k, v);
    }
    partition.add_document(doc)?;
    let generation = partition.commit()?;
    println!(
        "committed id={} to {} (generation {})",
        args.id,
        partition.folder().display(),
        generation
    );
    Ok(0)
}
