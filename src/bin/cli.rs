//! heapstore CLI
//!
//! Command-line access to a heap array directory.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use heapstore::heap::HeapEntries;
use heapstore::{ArrayConfig, HeapArray, KeyOrder, PreferNewer, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// heapstore CLI
#[derive(Parser, Debug)]
#[command(name = "heapstore-cli")]
#[command(about = "Inspect and modify heapstore BLOB arrays")]
#[command(version)]
struct Args {
    /// Array directory
    #[arg(short, long, default_value = "./heapstore_data")]
    dir: PathBuf,

    /// Shard file name prefix
    #[arg(short, long, default_value = "blob")]
    prefix: String,

    /// Fixed key length in bytes
    #[arg(short, long, default_value = "12")]
    keylength: usize,

    /// Key order of the index
    #[arg(short, long, value_enum, default_value = "natural")]
    order: OrderArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OrderArg {
    Natural,
    Base64,
}

impl From<OrderArg> for KeyOrder {
    fn from(arg: OrderArg) -> Self {
        match arg {
            OrderArg::Natural => KeyOrder::Natural,
            OrderArg::Base64 => KeyOrder::Base64,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a payload under a key
    Put {
        key: String,
        value: String,
    },

    /// Print the payload of a key
    Get {
        key: String,

        /// Print the copies of every shard, oldest first
        #[arg(long)]
        all: bool,
    },

    /// Remove a key from every shard
    Remove {
        key: String,
    },

    /// List keys
    Keys {
        /// Descending order
        #[arg(long)]
        down: bool,

        /// Start at this key
        #[arg(long)]
        from: Option<String>,

        /// Print at most this many keys
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Print shard and key counts
    Stats,

    /// Merge the best matching pair of shards
    Compact {
        /// Largest accepted size ratio of the pair
        #[arg(long, default_value = "4.0")]
        max_ratio: f32,

        /// Largest combined size of the pair in bytes
        #[arg(long, default_value_t = u64::from(u32::MAX))]
        max_combined: u64,
    },

    /// Print the raw records of one heap file
    Dump {
        file: PathBuf,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,heapstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    if let Commands::Dump { file } = &args.command {
        return dump(file, args.keylength);
    }
    let config = ArrayConfig::builder()
        .dir(&args.dir)
        .prefix(&args.prefix)
        .keylength(args.keylength)
        .order(args.order.into())
        .build();
    let array = HeapArray::open(config)?;

    let outcome = execute(&array, args.command);
    let closed = array.close(true);
    outcome.and(closed)
}

fn execute(array: &HeapArray, command: Commands) -> Result<()> {
    match command {
        Commands::Put { key, value } => {
            array.put(key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        Commands::Get { key, all: false } => match array.get(key.as_bytes())? {
            Some(payload) => println!("{}", String::from_utf8_lossy(&payload)),
            None => println!("(nil)"),
        },
        Commands::Get { key, all: true } => {
            for payload in array.get_all(key.as_bytes())? {
                println!("{}", String::from_utf8_lossy(&payload?));
            }
        }
        Commands::Remove { key } => {
            array.remove(key.as_bytes())?;
            println!("OK");
        }
        Commands::Keys { down, from, limit } => {
            let keys = array.keys_from(!down, from.as_ref().map(|k| k.as_bytes()))?;
            for key in keys.take(limit.unwrap_or(usize::MAX)) {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
        Commands::Stats => {
            println!("array:   {}", array.name());
            println!("shards:  {}", array.entries());
            println!("keys:    {}", array.size());
            println!("bytes:   {}", array.length_bytes());
            println!("memory:  {}", array.mem());
            for (path, size) in array.shard_paths().iter().zip(array.sizes()) {
                println!("  {} ({} keys)", path.display(), size);
            }
        }
        Commands::Compact {
            max_ratio,
            max_combined,
        } => match array.unmount_best_match(max_ratio, max_combined)? {
            Some((a, b)) => match array.merge_mount(&a, &b, &PreferNewer)? {
                Some(merged) => println!("merged into {}", merged.display()),
                None => println!("both shards were empty"),
            },
            None => println!("no shards to merge"),
        },
        Commands::Dump { file } => dump(&file, array.keylength())?,
    }
    Ok(())
}

fn dump(file: &Path, keylength: usize) -> Result<()> {
    let mut records = 0;
    for entry in HeapEntries::open(file, keylength)? {
        let (key, payload) = entry?;
        println!(
            "{}\t{} bytes\t{}",
            String::from_utf8_lossy(&key),
            payload.len(),
            String::from_utf8_lossy(&payload)
        );
        records += 1;
    }
    tracing::info!("{} records in {}", records, file.display());
    Ok(())
}
