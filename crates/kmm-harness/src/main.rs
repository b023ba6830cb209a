#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use kmm::AllocPolicy;
use kmm_harness::{
    AllocStressConfig, CacheStressConfig, run_alloc_stress, run_cache_stress,
};
use std::env;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("cache-stress") => cache_stress(&args[1..]),
        Some("alloc-stress") => alloc_stress(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn cache_stress(args: &[String]) -> Result<()> {
    let mut config = CacheStressConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--threads" => {
                let raw = args.get(index + 1).context("--threads requires a value")?;
                config.threads = raw.parse().context("invalid --threads value")?;
                index += 2;
            }
            "--ops" => {
                let raw = args.get(index + 1).context("--ops requires a value")?;
                config.ops_per_thread = raw.parse().context("invalid --ops value")?;
                index += 2;
            }
            "--blocks" => {
                let raw = args.get(index + 1).context("--blocks requires a value")?;
                config.blocks = raw.parse().context("invalid --blocks value")?;
                index += 2;
            }
            "--seed" => {
                let raw = args.get(index + 1).context("--seed requires a value")?;
                config.seed = raw.parse().context("invalid --seed value")?;
                index += 2;
            }
            other => bail!("unknown cache-stress flag: {other}"),
        }
    }
    if config.buffers_per_shard < config.threads {
        config.buffers_per_shard = config.threads;
    }

    let report = run_cache_stress(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn alloc_stress(args: &[String]) -> Result<()> {
    let mut config = AllocStressConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--policy" => {
                let raw = args.get(index + 1).context("--policy requires a value")?;
                config.policy = match raw.as_str() {
                    "per-core" => AllocPolicy::PerCore,
                    "ref-counted" => AllocPolicy::RefCounted,
                    other => bail!("unknown policy: {other} (per-core|ref-counted)"),
                };
                index += 2;
            }
            "--cores" => {
                let raw = args.get(index + 1).context("--cores requires a value")?;
                config.cores = raw.parse().context("invalid --cores value")?;
                index += 2;
            }
            "--pages" => {
                let raw = args.get(index + 1).context("--pages requires a value")?;
                config.pages = raw.parse().context("invalid --pages value")?;
                index += 2;
            }
            "--ops" => {
                let raw = args.get(index + 1).context("--ops requires a value")?;
                config.ops_per_thread = raw.parse().context("invalid --ops value")?;
                index += 2;
            }
            "--seed" => {
                let raw = args.get(index + 1).context("--seed requires a value")?;
                config.seed = raw.parse().context("invalid --seed value")?;
                index += 2;
            }
            other => bail!("unknown alloc-stress flag: {other}"),
        }
    }

    let report = run_alloc_stress(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_usage() {
    eprintln!(
        "kmm-harness — stress workloads for the kmm memory core

USAGE:
    kmm-harness cache-stress [--threads N] [--ops N] [--blocks N] [--seed N]
    kmm-harness alloc-stress [--policy per-core|ref-counted] [--cores N]
                             [--pages N] [--ops N] [--seed N]

Each command prints a JSON report on success."
    );
}
