use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use colored::Colorize;
use serde_json::{json, Value};
use tc_codec::Pipeline;
use tc_engine::{
    EngineConfig, Htype, HttpFactory, InlineChunkEngine, InlineResolver, LinkCreds,
    LinkedChunkEngine, LinkedResolver, ReadOptions, TensorConfig, TensorMeta,
};
use tc_store::{keys, LocalProvider, ObjectCache, WriteSession};
use tc_types::{CommitId, CompressedSample, IndexEntry, NdArray, Sample, Scalar};

use crate::cli::*;

/// An opened dataset directory.
struct Dataset {
    cache: Arc<ObjectCache>,
    defaults: EngineConfig,
    creds: Arc<LinkCreds>,
    commit: CommitId,
}

enum Tensor {
    Inline(InlineChunkEngine),
    Linked(LinkedChunkEngine),
}

impl Dataset {
    fn open(cli: &Cli) -> anyhow::Result<Self> {
        let provider = LocalProvider::open(&cli.root)
            .with_context(|| format!("cannot open dataset at {}", cli.root.display()))?;
        let cache = Arc::new(ObjectCache::new(Arc::new(provider)));
        let defaults = match &cli.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("cannot load {}", path.display()))?,
            None => EngineConfig::default(),
        };
        let web = HttpFactory::new(Duration::from_secs(defaults.link_fetch_timeout_secs))?;
        let creds = Arc::new(LinkCreds::load(&cache, Arc::new(web))?);
        Ok(Self {
            cache,
            defaults,
            creds,
            commit: CommitId::first(),
        })
    }

    fn resolver(&self) -> LinkedResolver {
        LinkedResolver::new(self.creds.clone())
            .with_presigned_url_full(self.defaults.presigned_url_full)
    }

    fn tensor(&self, name: &str) -> anyhow::Result<Tensor> {
        let meta_key = keys::tensor_meta_key(name, self.commit.as_str());
        let is_link = self
            .cache
            .get_object::<TensorMeta>(&meta_key)?
            .map(|m| m.read().expect("lock poisoned").is_link)
            .unwrap_or(false);
        let tensor = if is_link {
            Tensor::Linked(LinkedChunkEngine::open(
                name,
                self.commit.clone(),
                self.cache.clone(),
                Pipeline::new(),
                self.resolver(),
            )?)
        } else {
            Tensor::Inline(InlineChunkEngine::open(
                name,
                self.commit.clone(),
                self.cache.clone(),
                Pipeline::new(),
                InlineResolver,
            )?)
        };
        Ok(tensor)
    }

    fn session(&self) -> anyhow::Result<WriteSession> {
        Ok(WriteSession::new(self.cache.clone())?)
    }
}

impl Tensor {
    fn meta(&self) -> TensorMeta {
        match self {
            Self::Inline(e) => e.meta(),
            Self::Linked(e) => e.meta(),
        }
    }

    fn len(&self) -> u64 {
        match self {
            Self::Inline(e) => e.len(),
            Self::Linked(e) => e.len(),
        }
    }

    fn num_chunks(&self) -> usize {
        match self {
            Self::Inline(e) => e.num_chunks(),
            Self::Linked(e) => e.num_chunks(),
        }
    }
}

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let ds = Dataset::open(&cli)?;
    let format = cli.format;
    match cli.command {
        Command::Create(args) => cmd_create(&ds, args),
        Command::Append(args) => cmd_append(&ds, args),
        Command::Link(args) => cmd_link(&ds, args),
        Command::Info(args) => cmd_info(&ds, args, format),
        Command::Read(args) => cmd_read(&ds, args, format),
        Command::Pop(args) => cmd_pop(&ds, args),
        Command::Creds(args) => cmd_creds(&ds, args),
        Command::CheckLinks => cmd_check_links(&ds),
    }
}

fn cmd_create(ds: &Dataset, args: CreateArgs) -> anyhow::Result<()> {
    let session = ds.session()?;
    let mut config = TensorConfig::new();
    config.htype = args.htype.clone();
    config.dtype = args.dtype;
    config.sample_compression = args.sample_compression;
    config.chunk_compression = args.chunk_compression;
    config.max_chunk_size = args.max_chunk_size;
    if args.no_verify {
        config = config.verify(false);
    }
    let htype = match args.htype.as_deref() {
        Some(h) => h.parse::<Htype>()?,
        None => Htype::default(),
    };
    let meta = if htype.is_link {
        LinkedChunkEngine::create(
            &args.tensor,
            ds.commit.clone(),
            ds.cache.clone(),
            Pipeline::new(),
            ds.resolver(),
            &config,
            &ds.defaults,
        )?
        .meta()
    } else {
        InlineChunkEngine::create(
            &args.tensor,
            ds.commit.clone(),
            ds.cache.clone(),
            Pipeline::new(),
            InlineResolver,
            &config,
            &ds.defaults,
        )?
        .meta()
    };
    session.finish()?;
    println!(
        "{} Created tensor {} ({})",
        "✓".green().bold(),
        args.tensor.bold(),
        meta.htype.to_string().cyan()
    );
    Ok(())
}

fn cmd_append(ds: &Dataset, args: AppendArgs) -> anyhow::Result<()> {
    let session = ds.session()?;
    let Tensor::Inline(mut engine) = ds.tensor(&args.tensor)? else {
        anyhow::bail!("{} is a link tensor; use `tc link`", args.tensor);
    };
    let samples = args
        .files
        .iter()
        .map(|path| {
            CompressedSample::read(path)
                .map(Sample::Compressed)
                .with_context(|| format!("cannot read {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let added = engine.extend(samples)?;
    let written = session.finish()?;
    tracing::debug!(objects = written, "flushed");
    println!(
        "{} Appended {} sample(s) to {} (length {})",
        "✓".green().bold(),
        added,
        args.tensor.bold(),
        engine.len()
    );
    Ok(())
}

fn cmd_link(ds: &Dataset, args: LinkArgs) -> anyhow::Result<()> {
    let session = ds.session()?;
    let Tensor::Linked(mut engine) = ds.tensor(&args.tensor)? else {
        anyhow::bail!("{} is not a link tensor; use `tc append`", args.tensor);
    };
    let samples = args
        .paths
        .iter()
        .map(|p| Sample::link(p.as_str(), args.creds_key.as_deref()))
        .collect();
    let added = engine.extend(samples)?;
    session.finish()?;
    println!(
        "{} Linked {} sample(s) into {} (length {})",
        "✓".green().bold(),
        added,
        args.tensor.bold(),
        engine.len()
    );
    Ok(())
}

fn cmd_info(ds: &Dataset, args: InfoArgs, format: OutputFormat) -> anyhow::Result<()> {
    let tensor = ds.tensor(&args.tensor)?;
    let meta = tensor.meta();
    if let OutputFormat::Json = format {
        let mut value = serde_json::to_value(&meta)?;
        value["num_chunks"] = json!(tensor.num_chunks());
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    let name = |c: Option<tc_codec::Compression>| c.map_or("none".to_string(), |c| c.to_string());
    println!("Tensor {}", args.tensor.bold());
    println!("  htype:              {}", meta.htype.to_string().cyan());
    println!(
        "  dtype:              {}",
        meta.dtype.map_or("(unset)".to_string(), |d| d.to_string())
    );
    println!("  sample compression: {}", name(meta.sample_compression));
    println!("  chunk compression:  {}", name(meta.chunk_compression));
    println!("  length:             {}", meta.length.to_string().yellow());
    println!("  chunks:             {}", tensor.num_chunks());
    println!("  min shape:          {:?}", meta.min_shape);
    println!("  max shape:          {:?}", meta.max_shape);
    println!("  compressed bytes:   {}", meta.num_compressed_bytes);
    println!("  uncompressed bytes: {}", meta.num_uncompressed_bytes);
    Ok(())
}

fn cmd_read(ds: &Dataset, args: ReadArgs, format: OutputFormat) -> anyhow::Result<()> {
    let tensor = ds.tensor(&args.tensor)?;
    if args.path {
        let Tensor::Linked(engine) = &tensor else {
            anyhow::bail!("{} stores no paths", args.tensor);
        };
        let entry = args.index.sample_entry().copied().unwrap_or(IndexEntry::all());
        for i in entry.positions(0, tensor.len() as usize)? {
            let link = engine.linked_sample(i as u64)?;
            match link.creds_key {
                Some(key) => println!("{}\t{}\t{}", i, link.path, key.dimmed()),
                None => println!("{}\t{}", i, link.path),
            }
        }
        return Ok(());
    }

    let opts = ReadOptions {
        decompress: !args.raw,
        ..ReadOptions::default()
    };
    let arrays = match &tensor {
        Tensor::Inline(e) => e.read(&args.index, opts)?,
        Tensor::Linked(e) => e.read(&args.index, opts)?,
    };
    for array in &arrays {
        match format {
            OutputFormat::Json => println!("{}", array_json(array)),
            OutputFormat::Text => println!(
                "{} {:?} {}",
                array.dtype().to_string().cyan(),
                array.shape(),
                preview(array)
            ),
        }
    }
    Ok(())
}

fn cmd_pop(ds: &Dataset, args: PopArgs) -> anyhow::Result<()> {
    let session = ds.session()?;
    let len = match ds.tensor(&args.tensor)? {
        Tensor::Inline(mut e) => {
            e.pop_last(args.count)?;
            e.len()
        }
        Tensor::Linked(mut e) => {
            e.pop_last(args.count)?;
            e.len()
        }
    };
    session.finish()?;
    println!(
        "{} Removed {} sample(s) from {} (length {})",
        "✓".green().bold(),
        args.count,
        args.tensor.bold(),
        len
    );
    Ok(())
}

fn cmd_creds(ds: &Dataset, args: CredsArgs) -> anyhow::Result<()> {
    match args.action {
        Some(CredsAction::Add { key, managed }) => {
            let session = ds.session()?;
            ds.creds.add_creds_key(&key, managed)?;
            ds.creds.save(&ds.cache)?;
            session.finish()?;
            let kind = if managed { "managed" } else { "unmanaged" };
            println!("{} Added {} creds key {}", "✓".green().bold(), kind, key.bold());
        }
        None => {
            let used = ds.creds.used_creds_keys();
            let keys = ds.creds.creds_keys();
            if keys.is_empty() {
                println!("No creds keys.");
            }
            for key in keys {
                let managed = if ds.creds.is_managed(&key) { " (managed)" } else { "" };
                let marker = if used.contains(&key) { "*".green() } else { " ".normal() };
                println!("{} {}{}", marker, key.bold(), managed.dimmed());
            }
        }
    }
    Ok(())
}

fn cmd_check_links(ds: &Dataset) -> anyhow::Result<()> {
    let used = ds.creds.used_creds_keys();
    let missing: Vec<String> = ds
        .creds
        .missing_keys()
        .into_iter()
        .filter(|k| used.contains(k))
        .collect();
    if missing.is_empty() {
        println!("{} All links ready.", "✓".green().bold());
        return Ok(());
    }
    for key in &missing {
        println!("  {} {}", "missing:".red(), key);
    }
    anyhow::bail!("{} creds key(s) need to be populated", missing.len())
}

fn scalar_json(s: Scalar) -> Value {
    match s {
        Scalar::Bool(b) => json!(b),
        Scalar::Int(v) => match i64::try_from(v) {
            Ok(v) => json!(v),
            Err(_) => json!(v as f64),
        },
        Scalar::Float(f) => json!(f),
    }
}

fn array_json(array: &NdArray) -> Value {
    json!({
        "dtype": array.dtype().to_string(),
        "shape": array.shape(),
        "values": array.scalars().map(scalar_json).collect::<Vec<_>>(),
    })
}

fn preview(array: &NdArray) -> String {
    const SHOWN: usize = 8;
    let head: Vec<String> = array
        .scalars()
        .take(SHOWN)
        .map(|s| scalar_json(s).to_string())
        .collect();
    if array.num_elements() > SHOWN {
        format!("[{}, ...]", head.join(", "))
    } else {
        format!("[{}]", head.join(", "))
    }
}
