//! Command-line shell over a JSON-described process image: `count`/`list`/`summarize` run the
//! same pipeline the library exposes, so this binary is mostly argument plumbing and a small
//! in-memory stand-in for the image a real core-file reader would back with mmap.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use heapscope_core::{
    Allocation, AllocationIndex, Counter, Directory, Enumerator, Lister, ProcessImage, QueryDefaults, QuerySwitches,
    RangeAttributes, SeedIterator, SetOperation, SignatureDirectory, TagHolder, TaggerRunner, VirtualAddressMap,
};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "heapscope", about = "Offline heap forensics over a captured process image")]
struct Args {
    /// Path to a JSON scene file describing allocations and their contents.
    #[arg(long)]
    scene: PathBuf,

    /// Which seed set to run the query over.
    #[arg(long, default_value = "used")]
    seed: SeedKind,

    /// Only visit allocations at least this many bytes.
    #[arg(long)]
    min_size: Option<u64>,

    /// Only visit allocations at most this many bytes.
    #[arg(long)]
    max_size: Option<u64>,

    /// Path to a JSON file of query defaults (geometric sample base, allowMissingSignatures,
    /// anchor-chain fanout cap). Missing switches fall back to `QueryDefaults::default()`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// A `/switch value` query-time token, repeatable. Parsed in bulk alongside `--min-size`/
    /// `--max-size` by `QuerySwitches::parse`; e.g. `--switch /minincoming --switch 1`.
    #[arg(long = "switch")]
    switches: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum SeedKind {
    All,
    Used,
    Free,
    Leaked,
}

#[derive(Subcommand)]
enum Command {
    /// Counts allocations surviving the query.
    Count,
    /// Lists the indices of allocations surviving the query.
    List,
    /// Prints one `index @ address` line per surviving allocation.
    Summarize,
}

#[derive(Deserialize)]
struct AllocationRecord {
    address: String,
    size: u64,
    #[serde(default)]
    used: bool,
    #[serde(default)]
    thread_cached: bool,
    #[serde(default)]
    words: Vec<String>,
}

#[derive(Deserialize)]
struct Scene {
    allocations: Vec<AllocationRecord>,
    #[serde(default)]
    static_ranges: Vec<(String, String)>,
}

fn parse_hex(text: &str) -> Option<u64> {
    u64::from_str_radix(text.trim_start_matches("0x"), 16).ok()
}

/// A flat, fully-resident stand-in for a core file's mapped memory: every allocation's declared
/// words are materialized into one contiguous byte buffer keyed by its base address.
struct SceneMap {
    buffers: BTreeMap<u64, Vec<u8>>,
}

impl SceneMap {
    fn build(scene: &Scene) -> Self {
        let mut buffers = BTreeMap::new();
        for record in &scene.allocations {
            let base = parse_hex(&record.address).unwrap_or_else(|| panic!("bad address {}", record.address));
            let mut bytes = vec![0u8; record.size as usize];
            for (i, word) in record.words.iter().enumerate() {
                let value = parse_hex(word).unwrap_or_else(|| panic!("bad word {word}"));
                let offset = i * 8;
                if offset + 8 <= bytes.len() {
                    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
                }
            }
            buffers.insert(base, bytes);
        }
        SceneMap { buffers }
    }

    fn locate(&self, addr: u64) -> Option<(&u64, &Vec<u8>)> {
        self.buffers
            .range(..=addr)
            .next_back()
            .filter(|(&base, bytes)| addr < base + bytes.len() as u64)
    }
}

impl VirtualAddressMap<u64> for SceneMap {
    fn find_mapped_memory_image(&self, addr: u64) -> Option<&[u8]> {
        self.locate(addr).map(|(&base, bytes)| &bytes[(addr - base) as usize..])
    }

    fn read_pointer(&self, addr: u64) -> Option<u64> {
        let bytes = self.find_mapped_memory_image(addr)?;
        if bytes.len() < 8 {
            return None;
        }
        Some(u64::from_le_bytes(bytes[..8].try_into().unwrap()))
    }

    fn visit_ranges(&self, visitor: &mut dyn FnMut(RangeAttributes<u64>)) {
        for (&base, bytes) in &self.buffers {
            visitor(RangeAttributes {
                base,
                limit: base + bytes.len() as u64,
                readable: true,
                writable: true,
                executable: false,
                mapped: true,
                truncated: false,
            });
        }
    }
}

fn build_directory(scene: &Scene) -> Directory<u64> {
    let mut allocations: Vec<(u64, Allocation<u64>, bool)> = scene
        .allocations
        .iter()
        .map(|record| {
            let address = parse_hex(&record.address).unwrap_or_else(|| panic!("bad address {}", record.address));
            (address, Allocation::new(address, record.size, record.used), record.thread_cached)
        })
        .collect();
    allocations.sort_by_key(|(address, _, _)| *address);

    let thread_cached: Vec<bool> = allocations.iter().map(|(_, _, tc)| *tc).collect();
    let allocations: Vec<Allocation<u64>> = allocations.into_iter().map(|(_, allocation, _)| allocation).collect();
    Directory::new(allocations, thread_cached)
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let raw = match fs::read_to_string(&args.scene) {
        Ok(raw) => raw,
        Err(err) => {
            eprintln!("error: could not read {}: {err}", args.scene.display());
            return ExitCode::FAILURE;
        }
    };
    let scene: Scene = match serde_json::from_str(&raw) {
        Ok(scene) => scene,
        Err(err) => {
            eprintln!("error: could not parse {}: {err}", args.scene.display());
            return ExitCode::FAILURE;
        }
    };

    let directory = build_directory(&scene);
    let map = SceneMap::build(&scene);
    let static_ranges: Vec<(u64, u64)> = scene
        .static_ranges
        .iter()
        .map(|(base, limit)| {
            (
                parse_hex(base).unwrap_or_else(|| panic!("bad static range base {base}")),
                parse_hex(limit).unwrap_or_else(|| panic!("bad static range limit {limit}")),
            )
        })
        .collect();

    let signatures = SignatureDirectory::new();
    let mut image = ProcessImage::build(
        directory,
        &map,
        None,
        &static_ranges,
        None,
        None,
        None,
        signatures,
        TaggerRunner::new(),
    );

    let defaults: QueryDefaults = match &args.config {
        Some(path) => match fs::read_to_string(path).map(|raw| serde_json::from_str(&raw)) {
            Ok(Ok(defaults)) => defaults,
            Ok(Err(err)) => {
                eprintln!("error: could not parse {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
            Err(err) => {
                eprintln!("error: could not read {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => QueryDefaults::default(),
    };

    let tags = TagHolder::new(image.directory().num_allocations());
    let mut switch_tokens: Vec<&str> = args.switches.iter().map(String::as_str).collect();
    let min_size_text;
    if let Some(size) = args.min_size {
        min_size_text = format!("0x{size:x}");
        switch_tokens.push("/minsize");
        switch_tokens.push(&min_size_text);
    }
    let max_size_text;
    if let Some(size) = args.max_size {
        max_size_text = format!("0x{size:x}");
        switch_tokens.push("/maxsize");
        switch_tokens.push(&max_size_text);
    }
    let switches = match QuerySwitches::parse(&switch_tokens, image.signatures(), &tags, &defaults, true) {
        Ok(switches) => switches,
        Err(errors) => {
            for err in errors {
                eprintln!("error: {err}");
            }
            return ExitCode::FAILURE;
        }
    };

    let seed: Box<dyn Iterator<Item = AllocationIndex> + '_> = match args.seed {
        SeedKind::All => Box::new(SeedIterator::all(image.directory())),
        SeedKind::Used => Box::new(SeedIterator::used(image.directory())),
        SeedKind::Free => Box::new(SeedIterator::free(image.directory())),
        SeedKind::Leaked => Box::new(SeedIterator::leaked(image.directory(), image.anchors())),
    };

    let mut visited = heapscope_core::Set::new(image.directory().num_allocations());
    let is_leaked = |index: AllocationIndex| image.is_leaked(index);

    match args.command {
        Command::Count => {
            let mut counter = Counter::default();
            heapscope_core::run_pipeline(
                &switches,
                image.directory(),
                image.map(),
                image.graph(),
                image.tainted(),
                image.favored(),
                image.signatures(),
                &tags,
                &is_leaked,
                seed,
                &mut visited,
                &mut counter,
            );
            println!("{}", counter.count);
        }
        Command::List => {
            let mut lister = Lister::default();
            heapscope_core::run_pipeline(
                &switches,
                image.directory(),
                image.map(),
                image.graph(),
                image.tainted(),
                image.favored(),
                image.signatures(),
                &tags,
                &is_leaked,
                seed,
                &mut visited,
                &mut lister,
            );
            for index in lister.indices {
                println!("{index}");
            }
        }
        Command::Summarize => {
            let mut enumerator = Enumerator::default();
            heapscope_core::run_pipeline(
                &switches,
                image.directory(),
                image.map(),
                image.graph(),
                image.tainted(),
                image.favored(),
                image.signatures(),
                &tags,
                &is_leaked,
                seed,
                &mut visited,
                &mut enumerator,
            );
            for (index, address) in enumerator.entries {
                println!("{index} @ 0x{address:x}");
            }
        }
    }

    match switches.set_operation {
        Some(SetOperation::Assign) => image.derived_mut().assign(&visited),
        Some(SetOperation::Subtract) => image.derived_mut().subtract(&visited),
        None => {}
    }

    ExitCode::SUCCESS
}
