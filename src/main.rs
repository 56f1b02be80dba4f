use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;
use vximage::codec::{self, ImageReader, ImageWriter};
use vximage::consolidate::ConsolidationEngine;
use vximage::crypto::CryptoSession;
use vximage::disk::{DiskTopology, MemorySectors};
use vximage::header::{FormatCaps, Header, FLAG_DELTA_INDEX};
use vximage::index::{BlockKey, DeltaPayload};
use vximage::layout::{CompressionParams, FileLayout};
use vximage::retention::{self, ConflictRule, Retention, RetentionAction, RetentionConfig};
use vximage::set::{BackupSet, SetStore};
use vximage::store::{BlockStore, StoreLimits};
use vximage::types::{
    BackupType, CompressionLevel, CompressionMethod, ConsolidationType, EncryptionStrength,
    KeyDerivation, RetentionPeriod, RetentionType,
};

#[derive(Parser)]
#[command(name = "vxi", about = "The .vxi disk-image backup container CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Image a raw disk file into a backup set (full or incremental)
    Backup {
        /// Raw disk image to back up
        image: PathBuf,
        /// Backup store directory
        #[arg(short, long)]
        dir: PathBuf,
        /// Existing set to append an incremental to; omit for a new full
        #[arg(short, long)]
        set: Option<Uuid>,
        /// Logical block size in KiB
        #[arg(long, default_value = "64")]
        block_size: usize,
        /// Compression level: none, medium, high
        #[arg(short, long, default_value = "medium")]
        compression: String,
        /// Encrypt blocks with AES-256-GCM (Argon2id key derivation)
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Show one container's metadata
    Info {
        input: PathBuf,
    },
    /// List the backup sets in a store directory
    List {
        dir: PathBuf,
    },
    /// Re-resolve and check every block of one definition
    Verify {
        input: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Export the fully-resolved image seen at one definition
    Export {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Merge the oldest incremental into its base, or flatten to a synthetic full
    Consolidate {
        dir: PathBuf,
        #[arg(short, long)]
        set: Option<Uuid>,
        /// Replay the whole chain into a synthetic full instead of merging
        #[arg(long)]
        synthetic: bool,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Evaluate a retention rule against a set (dry run unless --apply)
    Retention {
        dir: PathBuf,
        #[arg(short, long)]
        set: Option<Uuid>,
        /// Incremental generations to keep
        #[arg(long)]
        keep_incrementals: Option<u32>,
        /// Differential generations to keep
        #[arg(long)]
        keep_differentials: Option<u32>,
        /// Full generations to keep
        #[arg(long)]
        keep_fulls: Option<u32>,
        /// Window unit: count, days, weeks
        #[arg(long, default_value = "count")]
        by: String,
        /// Keep expired-but-referenced definitions instead of merging them
        #[arg(long)]
        defer: bool,
        /// Execute the proposed actions
        #[arg(long)]
        apply: bool,
        #[arg(short, long)]
        password: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let caps = FormatCaps::default();
    match Cli::parse().command {
        Commands::Backup { image, dir, set, block_size, compression, password } => {
            let level = CompressionLevel::from_name(&compression)
                .ok_or("compression must be none, medium or high")?;
            run_backup(&image, &dir, set, block_size * 1024, level, password.as_deref(), caps)?;
        }

        Commands::Info { input } => {
            let file = std::fs::File::open(&input)?;
            let reader = ImageReader::open_metadata(file, caps)?;
            let header = reader.header();
            let layout = reader.layout();
            println!("── .vxi container ──────────────────────────────────────");
            println!("  Path            {}", input.display());
            println!("  Format version  {}.{}", header.version_major, header.version_minor);
            println!("  Definition      {}", header.definition_id);
            println!("  Set             {}", header.set_id);
            println!("  Type            {}", header.backup_type.name());
            println!("  Increment       {}", header.increment_number);
            match header.parent() {
                Some(parent) => println!("  Parent          {parent}"),
                None => println!("  Parent          (root)"),
            }
            println!("  Encrypted       {}", header.is_encrypted());
            println!("  Delta entries   {}", header.flags & FLAG_DELTA_INDEX != 0);
            println!("  Compression     {}", layout.compression.level.name());
            println!("  Blocks          {}", reader.index().entries.len());
            println!("  Index offset    {} B", header.index_offset);
            for disk in &layout.disks {
                println!("  Disk {}          {:?}, {} partitions", disk.disk_number,
                         disk.disk_format, disk.partitions.len());
            }
        }

        Commands::List { dir } => {
            let store = SetStore::new(&dir, caps);
            let count = store.scan()?;
            println!("Store: {} ({count} sets)", dir.display());
            for set_id in store.set_ids() {
                let set = store.set(set_id).ok_or("set disappeared during listing")?;
                let set = set.read();
                println!("  Set {set_id}");
                let mut defs = set.newest_first();
                defs.reverse();
                for def in defs {
                    println!(
                        "    #{:<3} {:<14} {}  blocks={:<5} {}",
                        def.increment_number,
                        def.backup_type.name(),
                        def.definition_id,
                        def.index.entries.len(),
                        def.path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
                    );
                }
            }
        }

        Commands::Verify { input, password } => {
            let (set, definition_id) = set_for_file(&input, caps)?;
            let set = set.read();
            let mut store =
                BlockStore::for_set(&set, caps, StoreLimits::default(), password.as_deref());
            let checked = store.verify(definition_id)?;
            println!("OK: {checked} blocks verified in {}", input.display());
        }

        Commands::Export { input, output, password } => {
            let (set, definition_id) = set_for_file(&input, caps)?;
            let set = set.read();
            let block_size = {
                let file = std::fs::File::open(&input)?;
                let reader = ImageReader::open_metadata(file, caps)?;
                reader
                    .layout()
                    .disks
                    .first()
                    .and_then(|d| d.partitions.first())
                    .map(|p| p.header.block_size as usize)
                    .unwrap_or(64 * 1024)
            };
            let mut store =
                BlockStore::for_set(&set, caps, StoreLimits::default(), password.as_deref());
            let out = std::io::BufWriter::new(std::fs::File::create(&output)?);
            let written = store.export(definition_id, block_size, out)?;
            println!("Exported {written} B to {}", output.display());
        }

        Commands::Consolidate { dir, set, synthetic, password } => {
            let set_arc = open_single_set(&dir, set, caps)?;
            let mut set = set_arc.write();
            let mut engine =
                ConsolidationEngine::new(caps, StoreLimits::default(), password.as_deref());
            if synthetic {
                let leaf = newest_leaf(&set).ok_or("set is empty")?;
                let new_id = engine.synthetic_full(&mut set, leaf)?;
                println!("Synthetic full: {new_id}");
            } else {
                match engine.merge_oldest(&mut set)? {
                    Some(outcome) => println!(
                        "Merged {} into {} ({} blocks)",
                        outcome.source, outcome.target, outcome.blocks_written
                    ),
                    None => println!("Nothing to merge"),
                }
            }
        }

        Commands::Retention {
            dir,
            set,
            keep_incrementals,
            keep_differentials,
            keep_fulls,
            by,
            defer,
            apply,
            password,
        } => {
            let period = match by.as_str() {
                "count" => RetentionPeriod::Count,
                "days" => RetentionPeriod::Days,
                "weeks" => RetentionPeriod::Weeks,
                _ => return Err("window unit must be count, days or weeks".into()),
            };
            let mut rules = Vec::new();
            let mut push = |retention_type, value: Option<u32>, consolidation| {
                if let Some(value) = value {
                    rules.push(Retention { retention_type, period, value, consolidation });
                }
            };
            push(RetentionType::Incremental, keep_incrementals, ConsolidationType::IncrementalMerge);
            push(RetentionType::Differential, keep_differentials, ConsolidationType::IncrementalMerge);
            push(RetentionType::Full, keep_fulls, ConsolidationType::SyntheticFull);
            if rules.is_empty() {
                return Err("no retention rule given; pass at least one --keep-* option".into());
            }
            let config = RetentionConfig {
                rules,
                conflict_rule: if defer {
                    ConflictRule::Defer
                } else {
                    ConflictRule::MergeThenDelete
                },
            };

            let set_arc = open_single_set(&dir, set, caps)?;
            let mut set = set_arc.write();
            let actions = retention::evaluate(&set, &config, chrono::Utc::now())?;
            for action in &actions {
                match action {
                    RetentionAction::Keep { definition_id } => println!("  keep    {definition_id}"),
                    RetentionAction::Merge { source, target } => {
                        println!("  merge   {source} into {target}")
                    }
                    RetentionAction::Delete { definition_id } => {
                        println!("  delete  {definition_id}")
                    }
                }
            }
            if apply {
                let mut engine =
                    ConsolidationEngine::new(caps, StoreLimits::default(), password.as_deref());
                let report = engine.apply(&mut set, &actions)?;
                println!(
                    "Applied: {} merged, {} deleted, {} deferred",
                    report.merged, report.deleted, report.deferred
                );
            } else {
                println!("Dry run; pass --apply to execute");
            }
        }
    }
    Ok(())
}

fn run_backup(
    image_path: &Path,
    dir: &Path,
    set: Option<Uuid>,
    block_size: usize,
    level: CompressionLevel,
    password: Option<&str>,
    caps: FormatCaps,
) -> Result<(), Box<dyn std::error::Error>> {
    let image = std::fs::read(image_path)?;
    let blocks: Vec<&[u8]> = image.chunks(block_size).collect();

    let mut layout = FileLayout::new(Vec::new());
    let mut source = MemorySectors { image: &image };
    match DiskTopology::read(&mut source) {
        Ok(topology) => layout.disks.push(topology.to_disk_layout(0, block_size as u32)),
        Err(err) => eprintln!("  note: no partition table recognized ({err})"),
    }
    layout.compression = CompressionParams { method: CompressionMethod::Zstd, level };

    let session = match password {
        Some(password) => {
            let mut salt = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut salt);
            let kdf = KeyDerivation::PasswordBased { iterations: 3, salt: salt.to_vec() };
            let session = CryptoSession::create(EncryptionStrength::High, password, &kdf)?;
            layout.encryption = codec::encryption_params_for(&session, kdf);
            Some(session)
        }
        None => None,
    };

    let store_dir = SetStore::new(dir, caps);
    match set {
        None => {
            let set_id = Uuid::new_v4();
            let header = Header::new(set_id, BackupType::Full, None, 0);
            let path = store_dir.container_path(set_id, 0);
            let file = std::fs::File::create(&path)?;
            let mut writer = ImageWriter::create(file, header, &layout, session)?;
            for (i, block) in blocks.iter().enumerate() {
                writer.write_data_block(i as u32, block)?;
            }
            let header = writer.finalize()?;
            println!("Full backup {} ({} blocks)", header.definition_id, blocks.len());
            println!("  set  {set_id}");
            println!("  file {}", path.display());
        }
        Some(set_id) => {
            store_dir.scan()?;
            let set_arc = store_dir.set(set_id).ok_or("set not found in store directory")?;
            let set_guard = set_arc.read();
            let leaf_id = newest_leaf(&set_guard).ok_or("set is empty")?;
            let increment = set_guard.get(leaf_id)?.increment_number + 1;

            let mut block_store =
                BlockStore::for_set(&set_guard, caps, StoreLimits::default(), password);
            let header = Header::new(set_id, BackupType::Incremental, Some(leaf_id), increment);
            let path = store_dir.container_path(set_id, increment);
            let file = std::fs::File::create(&path)?;
            let mut writer = ImageWriter::create(file, header, &layout, session)?;

            let mut changed = 0u32;
            for (i, block) in blocks.iter().enumerate() {
                let block_index = i as u32;
                match block_store.read_block(leaf_id, block_index)? {
                    Some(previous) if previous == *block => {}
                    Some(previous) => {
                        let owner = block_store
                            .owner_of(leaf_id, block_index)?
                            .ok_or("owner vanished for a resolved block")?;
                        let delta = DeltaPayload::diff(
                            BlockKey { definition_id: owner, block_index },
                            &previous,
                            block,
                        );
                        writer.write_delta_block(block_index, &delta, block)?;
                        changed += 1;
                    }
                    None => {
                        writer.write_data_block(block_index, block)?;
                        changed += 1;
                    }
                }
            }
            let header = writer.finalize()?;
            println!(
                "Incremental {} ({} of {} blocks changed)",
                header.definition_id,
                changed,
                blocks.len()
            );
            println!("  file {}", path.display());
        }
    }
    Ok(())
}

/// Scan the file's directory and return the set it belongs to plus this
/// file's definition id.
fn set_for_file(
    input: &Path,
    caps: FormatCaps,
) -> Result<(Arc<RwLock<BackupSet>>, Uuid), Box<dyn std::error::Error>> {
    let file = std::fs::File::open(input)?;
    let reader = ImageReader::open_metadata(file, caps)?;
    let set_id = reader.header().set_id;
    let definition_id = reader.definition_id();
    drop(reader);

    let dir = input.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let store = SetStore::new(dir, caps);
    store.scan()?;
    let set = store.set(set_id).ok_or("container's set is incomplete in this directory")?;
    Ok((set, definition_id))
}

fn open_single_set(
    dir: &Path,
    set: Option<Uuid>,
    caps: FormatCaps,
) -> Result<Arc<RwLock<BackupSet>>, Box<dyn std::error::Error>> {
    let store = SetStore::new(dir, caps);
    let count = store.scan()?;
    match set {
        Some(set_id) => Ok(store.set(set_id).ok_or("set not found in store directory")?),
        None => {
            let ids = store.set_ids();
            match ids.as_slice() {
                [only] => Ok(store.set(*only).ok_or("set disappeared during scan")?),
                [] => Err("store directory contains no backup sets".into()),
                _ => Err(format!("{count} sets found; pick one with --set").into()),
            }
        }
    }
}

/// The definition no other definition names as parent; with a validated
/// linear chain this is the newest leaf.
fn newest_leaf(set: &BackupSet) -> Option<Uuid> {
    set.newest_first()
        .into_iter()
        .find(|d| set.children(d.definition_id).is_empty())
        .map(|d| d.definition_id)
}
