use clap::{Parser, Subcommand};
use std::path::PathBuf;

use emaildb_core::email::parse_message;
use emaildb_core::email_store::{CompoundId, EmailIndexes, EmailStore};
use emaildb_core::index::BTreeMapIndex;
use emaildb_core::{compact, target_batch_size, Block, BlockFile, BlockType};

#[derive(Parser)]
#[command(name = "emaildb-cli", version, about = "EmailDB core block file inspector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append a raw blob as a block with the given id and type
    Append {
        file: PathBuf,
        #[arg(long)]
        block_id: i64,
        #[arg(long, default_value = "11")]
        block_type: u8,
        #[arg(long)]
        data_file: PathBuf,
    },
    /// Read a block by id and print its payload length / a hex preview
    Read {
        file: PathBuf,
        #[arg(long)]
        block_id: i64,
    },
    /// Forward-scan the file and report recovered blocks + warnings
    Scan { file: PathBuf },
    /// Run offline compaction, dropping superseded blocks
    Compact { file: PathBuf },
    /// Store a message file (with headers) into the store's index/demo db
    Store {
        file: PathBuf,
        message_file: PathBuf,
    },
    /// Fetch an email by compound id
    Get {
        file: PathBuf,
        compound_id: String,
    },
    /// Print file size, live block count, and the current adaptive target
    Stats { file: PathBuf },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    match Cli::parse().command {
        Commands::Append {
            file,
            block_id,
            block_type,
            data_file,
        } => {
            let (mut bf, warnings) = BlockFile::open(&file, true)?;
            if !warnings.is_empty() {
                eprintln!("warning: {} scan warning(s) on open", warnings.len());
            }
            let data = std::fs::read(&data_file)?;
            let block = Block::new(BlockType::from_u8(block_type), block_id, now(), data);
            let loc = bf.append(&block)?;
            println!("appended block {block_id} at offset {} ({} bytes)", loc.position, loc.length);
        }

        Commands::Read { file, block_id } => {
            let (bf, _) = BlockFile::open(&file, false)?;
            let block = bf.read_by_id(block_id)?;
            println!("block_id={block_id} type={:?} payload_len={}", block.block_type, block.payload.len());
            let preview: Vec<String> = block.payload.iter().take(32).map(|b| format!("{b:02x}")).collect();
            println!("payload[..32]={}", preview.join(" "));
        }

        Commands::Scan { file } => {
            let data = std::fs::read(&file)?;
            let report = emaildb_core::scan(&data, 0);
            println!("recovered {} block(s), {} warning(s)", report.locations.len(), report.warnings.len());
            for loc in &report.locations {
                println!("  id={:<10} offset={:<10} len={}", loc.block_id, loc.position, loc.length);
            }
            for w in &report.warnings {
                println!("  warning: {w:?}");
            }
        }

        Commands::Compact { file } => {
            let stats = compact(&file)?;
            println!(
                "compacted: {} -> {} bytes ({} live blocks)",
                stats.size_before, stats.size_after, stats.live_blocks
            );
        }

        Commands::Store { file, message_file } => {
            let (mut bf, _) = BlockFile::open(&file, true)?;
            let raw = std::fs::read(&message_file)?;
            let msg = parse_message(&raw)?;

            let envelope = BTreeMapIndex::new();
            let content = BTreeMapIndex::new();
            let message_id = BTreeMapIndex::new();
            let indexes = EmailIndexes {
                envelope: &envelope,
                content: &content,
                message_id: &message_id,
            };
            let mut store = EmailStore::open(&mut bf, indexes)?;
            let compound = store.store(&msg, &raw)?;
            store.flush()?;
            println!("stored as {compound}");
        }

        Commands::Get { file, compound_id } => {
            let (mut bf, _) = BlockFile::open(&file, false)?;
            let compound = CompoundId::parse(&compound_id)?;
            let envelope = BTreeMapIndex::new();
            let content = BTreeMapIndex::new();
            let message_id = BTreeMapIndex::new();
            let indexes = EmailIndexes {
                envelope: &envelope,
                content: &content,
                message_id: &message_id,
            };
            let store = EmailStore::open(&mut bf, indexes)?;
            let data = store.get(compound)?;
            print!("{}", String::from_utf8_lossy(&data));
        }

        Commands::Stats { file } => {
            let (bf, warnings) = BlockFile::open(&file, false)?;
            let size = bf.file_size()?;
            println!("file:            {}", file.display());
            println!("size:            {size} bytes");
            println!("live blocks:     {}", bf.index.live_block_count());
            println!("superseded:      {} bytes", bf.index.superseded_bytes());
            println!("adaptive target: {} bytes", target_batch_size(size));
            println!("open warnings:   {}", warnings.len());
        }
    }

    Ok(())
}

fn now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
