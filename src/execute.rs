use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail, Result};
use colored::Colorize;
use formulary::build::{build_flags, ArchiveUnpacker, BuildOrchestrator, GoToolchain, HttpFetcher};
use formulary::error::InstallError;
use formulary::formula::Formula;
use formulary::global::cache::SourceCache;
use formulary::global::config::Config;
use formulary::livecheck::{GitHubReleases, VersionResolver};
use formulary::pipeline::{keg_dir, missing_build_dependencies, InstallPipeline, InstallReceipt};
use formulary::store::FormulaStore;
use formulary::util::Cancellation;
use formulary::verify::{InstallVerifier, VERSION_FLAG};
use semver::Version;
use tracing::debug;
use crate::cli::{FormularyCommand, CLI};

const RETRY_DELAY: Duration = Duration::from_secs(2);

pub fn execute(cli: CLI) -> Result<()> {
    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(dir) = cli.formula_dir {
        config.formula_dir = dir;
    }
    debug!(?config, "configuration");
    match cli.command {
        FormularyCommand::Check => {
            execute_check(&config)
        }
        FormularyCommand::Info { name, version } => {
            execute_info(&config, &name, version.as_deref())
        }
        FormularyCommand::Aliases { name } => {
            execute_aliases(&config, &name)
        }
        FormularyCommand::Flags { name, version } => {
            execute_flags(&config, &name, version.as_deref())
        }
        FormularyCommand::Livecheck { name, retries } => {
            execute_livecheck(&config, name.as_deref(), retries)
        }
        FormularyCommand::Install { name, version, all, prefix, keep_unverified } => {
            if let Some(prefix) = prefix {
                config.prefix = prefix;
            }
            execute_install(&config, name.as_deref(), version.as_deref(), all, keep_unverified)
        }
        FormularyCommand::Verify { artifact, expected, args } => {
            execute_verify(&config, &artifact, &expected, args)
        }
        FormularyCommand::Clean => {
            execute_clean()
        }
    }
}

/// Loads the formula directory, printing rejected records.
///
/// Rejections are reported but do not stop the remaining records from loading.
fn load_store(config: &Config) -> Result<(FormulaStore, usize)> {
    if !config.formula_dir.is_dir() {
        bail!("formula directory {} not found", config.formula_dir.display());
    }
    let store = FormulaStore::new();
    let report = store.load_dir(&config.formula_dir)?;
    for (path, err) in &report.rejected {
        eprintln!("{} {}: {}", "rejected".red().bold(), path.display(), err);
    }
    Ok((store, report.rejected.len()))
}

fn resolve(store: &FormulaStore, name: &str, version: Option<&str>) -> Result<Formula> {
    match version {
        Some(version) => {
            let version = Version::parse(version.trim_start_matches('v'))
                .map_err(|e| anyhow!("Invalid version {version}: {e}"))?;
            Ok(store.resolve_version(name, &version)?)
        }
        None => Ok(store.resolve(name)?),
    }
}

pub fn execute_check(config: &Config) -> Result<()> {
    let (store, rejected) = load_store(config)?;
    for name in store.names() {
        let versions: Vec<String> = store.versions(&name).iter().map(Version::to_string).collect();
        let aliases = store.aliases_of(&name);
        if aliases.is_empty() {
            println!("{name}: {}", versions.join(", "));
        } else {
            let aliases: Vec<&str> = aliases.iter().map(String::as_str).collect();
            println!("{name}: {} (alias of {})", versions.join(", "), aliases.join(", "));
        }
    }
    println!("{} formulas registered", store.len());
    if rejected > 0 {
        bail!("{rejected} formula record(s) rejected");
    }
    Ok(())
}

pub fn execute_info(config: &Config, name: &str, version: Option<&str>) -> Result<()> {
    let (store, _) = load_store(config)?;
    let formula = resolve(&store, name, version)?;
    println!("{} {}", formula.name.as_str().bold(), formula.version);
    println!("  {}", formula.description);
    println!("  homepage: {}", formula.homepage);
    println!("  source:   {}", formula.source_url);
    println!("  sha256:   {}", formula.checksum);
    println!("  license:  {}", formula.license);
    println!("  commit:   {}", formula.build_commit);
    println!("  date:     {}", formula.build_date);
    for dep in &formula.dependencies {
        println!("  depends on {} ({:?})", dep.name, dep.stage);
    }
    let aliases = store.aliases_of(&formula.name);
    if !aliases.is_empty() {
        let aliases: Vec<&str> = aliases.iter().map(String::as_str).collect();
        println!("  aliases:  {}", aliases.join(", "));
    }
    let receipt_path = keg_dir(&config.prefix, &formula).join(formulary::pipeline::RECEIPT_FILE);
    match InstallReceipt::load(&receipt_path) {
        Ok(receipt) if receipt.verified => println!("  installed"),
        Ok(_) => println!("  installed (unverified)"),
        Err(_) => println!("  not installed"),
    }
    Ok(())
}

pub fn execute_aliases(config: &Config, name: &str) -> Result<()> {
    let (store, _) = load_store(config)?;
    store.resolve(name)?;
    for alias in store.aliases_of(name) {
        println!("{alias}");
    }
    Ok(())
}

pub fn execute_flags(config: &Config, name: &str, version: Option<&str>) -> Result<()> {
    let (store, _) = load_store(config)?;
    let formula = resolve(&store, name, version)?;
    let output = keg_dir(&config.prefix, &formula).join("bin").join(&formula.name);
    for arg in build_flags(&formula, &output) {
        println!("{arg}");
    }
    Ok(())
}

pub fn execute_livecheck(config: &Config, name: Option<&str>, retries: Option<u32>) -> Result<()> {
    let (store, _) = load_store(config)?;
    let formulas = match name {
        Some(name) => vec![store.resolve(name)?],
        None => store.latest(),
    };
    let resolver = VersionResolver::new(GitHubReleases::new(&config.github_api, config.upstream_timeout())?);
    let retries = retries.unwrap_or(config.livecheck_retries);
    let results = resolver.check_all(&formulas, retries, RETRY_DELAY);
    for (formula, result) in formulas.iter().zip(results) {
        match result {
            Ok(status) if status.is_stale => {
                println!("{}: {} -> {} {}", status.name, status.current, status.upstream, "(stale)".yellow());
            }
            Ok(status) => {
                println!("{}: {} -> {} {}", status.name, status.current, status.upstream, "(up to date)".green());
            }
            Err(e) => {
                println!("{}: {} {}", formula.name, formula.version, format!("({e})").as_str().red());
            }
        }
    }
    Ok(())
}

pub fn execute_install(
    config: &Config,
    name: Option<&str>,
    version: Option<&str>,
    all: bool,
    keep_unverified: bool,
) -> Result<()> {
    let (store, _) = load_store(config)?;
    let formulas = match (name, all) {
        (Some(name), _) => vec![resolve(&store, name, version)?],
        (None, true) => store.latest(),
        (None, false) => bail!("Name a formula to install, or pass --all"),
    };
    for formula in &formulas {
        let missing = missing_build_dependencies(formula);
        if !missing.is_empty() {
            bail!("{} needs {} to build", formula.name, missing.join(", "));
        }
    }

    let cache = if config.cache_sources {
        Some(SourceCache::global()?)
    } else {
        None
    };
    let orchestrator = BuildOrchestrator::new(
        Arc::new(HttpFetcher::new(config.fetch_timeout(), cache)?),
        Arc::new(ArchiveUnpacker),
        Arc::new(GoToolchain::locate()?),
        config.toolchain_timeout(),
    );
    let pipeline = InstallPipeline::new(orchestrator, InstallVerifier::new(config.verify_timeout()))
        .keep_unverified(keep_unverified);

    let jobs: Vec<(Formula, Vec<String>)> = formulas
        .into_iter()
        .map(|formula| {
            let aliases = store.aliases_of(&formula.name).into_iter().collect();
            (formula, aliases)
        })
        .collect();
    let results = pipeline.install_all(&jobs, &config.prefix, config.jobs, &Cancellation::new())?;

    let mut failed = 0;
    for ((formula, _), result) in jobs.iter().zip(results) {
        match result {
            Ok(receipt) if receipt.verified => {
                println!("{} {} {}", "installed".green().bold(), formula.name, receipt.artifact.display());
            }
            Ok(receipt) => {
                println!("{} {} {}", "unverified".yellow().bold(), formula.name, receipt.artifact.display());
            }
            Err(e) => {
                failed += 1;
                let label = match &e {
                    InstallError::Build(_) => "build failed",
                    InstallError::Verification { .. } => "verification failed",
                    InstallError::Receipt { .. } => "receipt failed",
                };
                eprintln!("{} {}: {}", label.red().bold(), formula.name, e);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} installs failed", jobs.len());
    }
    Ok(())
}

pub fn execute_verify(config: &Config, artifact: &Path, expected: &str, args: Vec<String>) -> Result<()> {
    let args = if args.is_empty() { vec![VERSION_FLAG.to_string()] } else { args };
    let artifact: PathBuf = artifact.canonicalize().unwrap_or_else(|_| artifact.to_path_buf());
    let verifier = InstallVerifier::new(config.verify_timeout());
    let output = verifier.run(&artifact, &args, expected, &Cancellation::new())?;
    println!("{} {}", "verified".green().bold(), output.trim());
    Ok(())
}

pub fn execute_clean() -> Result<()> {
    let cache = SourceCache::global()?;
    let removed = cache.clean()?;
    println!("Removed {removed} cached archive(s) from {}", cache.dir().display());
    Ok(())
}
