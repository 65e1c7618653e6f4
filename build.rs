use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    page_size: Option<usize>,
    trace_max: Option<usize>,
    ld_history: Option<usize>,
    zone_shift: Option<usize>,
    poll_every: Option<usize>,
    extend_by: Option<usize>,
    large_size: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
    #[serde(default, rename = "generation")]
    generations: Vec<GenerationDef>,
}

#[derive(Deserialize)]
struct GenerationDef {
    capacity_kb: usize,
    mortality: f64,
}

struct ResolvedConfig {
    page_size: usize,
    page_shift: u32,
    trace_max: usize,
    ld_history: usize,
    zone_shift: usize,
    poll_every: usize,
    extend_by: usize,
    large_size: usize,
    generations: Vec<(usize, f64)>,
}

fn resolve_config(cfg: &Config) -> ResolvedConfig {
    let c = &cfg.config;
    let page_size = c.page_size.unwrap_or(4096);
    assert!(
        page_size >= 4096 && page_size.is_power_of_two(),
        "page_size ({}) must be a power of 2 and >= 4096",
        page_size
    );

    // One trace slot. The condemnation and ramp machinery assume exclusive
    // use of the white zone set; the set-typed state tolerates more slots,
    // but nothing is gained by raising this yet.
    let trace_max = c.trace_max.unwrap_or(1);
    assert!(
        (1..=8).contains(&trace_max),
        "trace_max ({}) must be in 1..=8",
        trace_max
    );

    let ld_history = c.ld_history.unwrap_or(16);
    assert!(
        ld_history.is_power_of_two(),
        "ld_history ({}) must be a power of 2",
        ld_history
    );

    let zone_shift = c
        .zone_shift
        .unwrap_or(page_size.trailing_zeros() as usize + 4);
    assert!(
        (12..40).contains(&zone_shift),
        "zone_shift ({}) out of range 12..40",
        zone_shift
    );

    let poll_every = c.poll_every.unwrap_or(64 * 1024);
    assert!(poll_every > 0, "poll_every must be > 0");

    let extend_by = c.extend_by.unwrap_or(2 * page_size);
    assert!(
        extend_by > 0 && extend_by % page_size == 0,
        "extend_by ({}) must be a non-zero multiple of page_size",
        extend_by
    );

    let large_size = c.large_size.unwrap_or(8 * page_size);
    assert!(large_size > 0, "large_size must be > 0");

    let generations: Vec<(usize, f64)> = if cfg.generations.is_empty() {
        vec![(128, 0.85), (512, 0.45)]
    } else {
        cfg.generations
            .iter()
            .map(|g| (g.capacity_kb, g.mortality))
            .collect()
    };
    for (i, &(cap, mort)) in generations.iter().enumerate() {
        assert!(cap > 0, "generation {}: capacity_kb must be > 0", i);
        assert!(
            (0.0..=1.0).contains(&mort),
            "generation {}: mortality {} must be in 0..=1",
            i,
            mort
        );
    }

    ResolvedConfig {
        page_size,
        page_shift: page_size.trailing_zeros(),
        trace_max,
        ld_history,
        zone_shift,
        poll_every,
        extend_by,
        large_size,
        generations,
    }
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let gens = cfg
        .generations
        .iter()
        .map(|&(cap, mort)| format!("({}, {:?})", cap * 1024, mort))
        .collect::<Vec<_>>()
        .join(", ");

    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const PAGE_SHIFT: usize = {page_shift};\n\
         pub const PAGE_SIZE: usize = {page_size};\n\
         pub const TRACE_MAX: usize = {trace_max};\n\
         pub const LD_HISTORY: usize = {ld_history};\n\
         pub const DEFAULT_ZONE_SHIFT: usize = {zone_shift};\n\
         pub const DEFAULT_POLL_EVERY: usize = {poll_every};\n\
         pub const DEFAULT_EXTEND_BY: usize = {extend_by};\n\
         pub const DEFAULT_LARGE_SIZE: usize = {large_size};\n\
         /// Default generation chain: (capacity bytes, mortality).\n\
         pub const DEFAULT_CHAIN: &[(usize, f64)] = &[{gens}];\n",
        page_shift = cfg.page_shift,
        page_size = cfg.page_size,
        trace_max = cfg.trace_max,
        ld_history = cfg.ld_history,
        zone_shift = cfg.zone_shift,
        poll_every = cfg.poll_every,
        extend_by = cfg.extend_by,
        large_size = cfg.large_size,
        gens = gens,
    );

    fs::write(out_path, code).expect("failed to write generated config");
}

fn main() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let config_path = format!("{}/gcconfig.toml", manifest_dir);
    println!("cargo::rerun-if-changed={}", config_path);
    println!("cargo::rerun-if-changed=build.rs");

    let config: Config = match fs::read_to_string(&config_path) {
        Ok(text) => toml::from_str(&text).expect("gcconfig.toml: parse error"),
        Err(_) => Config::default(),
    };

    let resolved = resolve_config(&config);
    let out_dir = env::var("OUT_DIR").unwrap();
    generate_config(&resolved, Path::new(&out_dir).join("config.rs").as_path());
}
