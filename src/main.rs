use actix::prelude::*;
use anyhow::anyhow;
use indicatif::ProgressStyle;
use rewrite_import::{
    category::{self, SqliteCategoryRepository},
    config::ImportConfig,
    import::{ImportRunner, ImportService, RunImport},
    import_throttle::ImportThrottle,
    product::SqliteProductRepository,
    store::{self, SqliteStoreRepository},
    url_rewrite::SqliteUrlRewriteRepository,
};
use rw_types::category::CategoryRepository;
use rw_types::product::ProductRepository;
use rw_types::store::StoreRepository;
use rw_types::url_rewrite::service::UrlRewriteService;
use rw_types::url_rewrite::UrlRewriteRepository;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;

const USAGE: &str =
    "Usage: rewrite-import [--stores <stores.csv>] [--categories <categories.csv>] <products.csv>...";

#[derive(Debug, Default)]
struct Args {
    stores: Option<PathBuf>,
    categories: Option<PathBuf>,
    files: Vec<PathBuf>,
}

fn parse_args<I: Iterator<Item = String>>(mut args: I) -> Result<Args, anyhow::Error> {
    let mut res = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--stores" => {
                res.stores = Some(args.next().ok_or_else(|| anyhow!(USAGE))?.into());
            }
            "--categories" => {
                res.categories = Some(args.next().ok_or_else(|| anyhow!(USAGE))?.into());
            }
            "-h" | "--help" => return Err(anyhow!(USAGE)),
            _ => res.files.push(arg.into()),
        }
    }
    if res.files.is_empty() && res.stores.is_none() && res.categories.is_none() {
        return Err(anyhow!(USAGE));
    }
    Ok(res)
}

#[actix::main]
async fn main() -> Result<(), anyhow::Error> {
    if let Err(env::VarError::NotPresent) = env::var("RUST_LOG") {
        env::set_var("RUST_LOG", "INFO");
    }
    pretty_env_logger::formatted_timed_builder()
        .parse_default_env()
        .init();

    match std::fs::File::open(".env") {
        Ok(_) => envmnt::load_file(".env")?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::File::create(".env")?;
            envmnt::load_file(".env")?;
        }
        Err(err) => {
            return Err(anyhow!("Unable to open .env file: {err}"));
        }
    }

    let args = parse_args(env::args().skip(1))?;
    let config = ImportConfig::from_env()?;
    log::info!("Using database {}", config.database_path);
    if let Some(dir) = std::path::Path::new(&config.database_path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let conn = Connection::open(&config.database_path).await?;
    let url_rewrite_repo: Arc<dyn UrlRewriteRepository> =
        Arc::new(SqliteUrlRewriteRepository::init(conn.clone()).await?);
    let store_repo: Arc<dyn StoreRepository> =
        Arc::new(SqliteStoreRepository::init(conn.clone()).await?);
    let category_repo: Arc<dyn CategoryRepository> =
        Arc::new(SqliteCategoryRepository::init(conn.clone()).await?);
    let product_repo: Arc<dyn ProductRepository> =
        Arc::new(SqliteProductRepository::init(conn).await?);

    if let Some(path) = &args.stores {
        let count = store::import_stores(path, store_repo.clone()).await?;
        log::info!("Imported {count} store views from {}", path.display());
    }
    if let Some(path) = &args.categories {
        let count = category::import_categories(path, category_repo.clone()).await?;
        log::info!("Imported {count} categories from {}", path.display());
    }

    let service = Arc::new(UrlRewriteService::new(
        url_rewrite_repo,
        config.rewrite_options(),
    ));
    let runner = Arc::new(ImportRunner::new(
        service,
        product_repo,
        store_repo,
        category_repo,
        ImportThrottle::new(config.concurrency),
        config.batch_size,
    ));

    let pb_style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40} {pos:>7}/{len:7} {msg}");
    let pb_style = match pb_style {
        Ok(p) => Some(p.progress_chars("=-")),
        Err(err) => {
            log::warn!("Unable to initialize progress bar: {err}");
            None
        }
    };

    let token = CancellationToken::new();
    let import_service = ImportService::new(runner, token.clone(), pb_style).start();

    let t = token.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(_) => {
                log::warn!("Shutting down");
                t.cancel();
            }
            Err(err) => log::error!("Unable to listen to shutdown: {err}"),
        }
    });

    let mut failed = 0;
    for path in args.files {
        if token.is_cancelled() {
            log::warn!("Skipping {}", path.display());
            continue;
        }
        if import_service.send(RunImport(path)).await?.is_err() {
            failed += 1;
        }
    }
    if failed > 0 {
        return Err(anyhow!("{failed} import files failed"));
    }
    Ok(())
}
