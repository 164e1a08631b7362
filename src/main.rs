use log::{error, info};
use stats_handle::analyze::AnalyzeInput;
use stats_handle::flusher::FlushMode;
use stats_handle::{
    start_server, Config, Datum, HistKey, MemStore, MemorySchema, Result, StatsHandle,
};
use std::env;
use std::sync::Arc;

fn usage(program: &str) {
    eprintln!("Usage: {} [serve|demo|config] [config.toml]", program);
}

fn load_config(path: Option<&String>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("loading config from {}", path);
            Config::from_file(path)
        }
        None => Ok(Config::default()),
    }
}

/// Creates `demo.t(a, b)` with an index on `a` and analyzes a few rows so
/// the dump endpoints have something to show.
async fn seed_demo(handle: &StatsHandle, schema: &MemorySchema) -> Result<()> {
    schema.create_database("demo")?;
    let created = schema.create_table("demo", "t", &["a", "b"])?;
    let table_id = created.table_id();
    handle.handle_ddl_event(&created).await?;
    handle.handle_ddl_event(&schema.add_index("demo", "t", "idx_a", &["a"])?).await?;

    let a: Vec<Datum> = (0..100).map(Datum::Int).collect();
    let b: Vec<Datum> = (0..100).map(|i| Datum::Int((i * 37) % 11)).collect();
    let inputs = vec![
        AnalyzeInput { key: HistKey::column(table_id, 1), values: a.clone() },
        AnalyzeInput { key: HistKey::column(table_id, 2), values: b },
        AnalyzeInput { key: HistKey::index(table_id, 1), values: a },
    ];
    handle.analyze_table(table_id, 100, &inputs).await?;
    handle.record_delta(table_id, 5, 5);
    handle.dump_stats_delta(FlushMode::DumpAll).await?;
    info!("seeded demo.t as table {}", table_id);
    Ok(())
}

async fn serve(config: Config, demo: bool) -> Result<()> {
    let storage = Arc::new(MemStore::new());
    let schema = Arc::new(MemorySchema::new(storage.clone()));
    let port = config.listen_port;
    let handle = Arc::new(StatsHandle::new(config, storage, schema.clone())?);
    if demo {
        seed_demo(&handle, &schema).await?;
    }

    let tasks = handle.start()?;
    let served = start_server(handle.clone(), port, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for ctrl-c: {}", e);
        }
    })
    .await;
    tasks.shutdown().await;
    served
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("serve");

    let outcome = match mode {
        "serve" | "demo" => match load_config(args.get(2)) {
            Ok(config) => serve(config, mode == "demo").await,
            Err(e) => Err(e),
        },
        "config" => load_config(args.get(2)).map(|config| match toml::to_string_pretty(&config) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("cannot render config: {}", e),
        }),
        _ => {
            usage(args.first().map(String::as_str).unwrap_or("stats-handle"));
            std::process::exit(2);
        }
    };

    if let Err(e) = outcome {
        error!("{}", e);
        std::process::exit(1);
    }
}
