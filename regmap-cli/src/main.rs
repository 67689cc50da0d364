use std::{io, path};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use fs_err as fs;
use log::debug;
use regmap::{
    AccessorConfig, ByteTransport, FieldFilter, MemoryBus, RegisterMap, RegisterMapAccessor,
    ScanEvent, Settings,
};

#[derive(Parser)]
#[command(version, about, long_about = None, author = clap::crate_authors!())]
struct Cli {
    /// JSON register map database
    #[arg(long, value_name = "FILE")]
    map: path::PathBuf,

    /// JSON memory image standing in for the device
    ///
    /// Created if absent and rewritten after the command has run.
    #[arg(long, value_name = "FILE")]
    image: Option<path::PathBuf>,

    /// Bus address to use for every access instead of the one in the register map
    #[arg(long, value_parser = clap_num::maybe_hex::<u8>)]
    device_id: Option<u8>,

    /// Run without a device: reads return 0 and writes only go to the shadow store
    #[arg(long, action = clap::ArgAction::SetTrue)]
    dummy: bool,

    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the bus location of registers or bit-fields
    Resolve {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Read registers or bit-fields
    Get {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Write registers or bit-fields, in the given order
    ///
    /// Nothing is written unless every assignment is valid.
    Set {
        #[arg(required = true, value_name = "NAME=VALUE", value_parser = parse_assignment)]
        assignments: Vec<(String, u64)>,
    },
    /// Save register values to a settings file
    Save {
        file: path::PathBuf,
        /// Register or bit-field to save. Defaults to every register.
        #[arg(long = "name", action = clap::ArgAction::Append)]
        names: Vec<String>,
    },
    /// Apply a settings file
    Load { file: path::PathBuf },
    /// List user-writable bit-fields that differ from their reset value
    #[command(name = "non-default")]
    NonDefault {
        /// Only scan this table. Chain multiple for more tables.
        #[arg(long = "table", action = clap::ArgAction::Append, value_parser = clap_num::maybe_hex::<u8>)]
        tables: Vec<u8>,
    },
    /// Apply a chip sequence from the register map, e.g., SOFT_RESET
    Sequence { name: String },
    /// List the registers of the register map
    Ls {
        #[arg(long, default_value = "preserve")]
        sorting: Sorting,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Sorting {
    /// Register map order
    Preserve,
    Alpha,
    /// By table, then offset
    Address,
}

fn parse_assignment(s: &str) -> Result<(String, u64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, found {s:?}"))?;
    let value = clap_num::maybe_hex::<u64>(value.trim())?;
    Ok((name.trim().to_owned(), value))
}

/// Load the memory image, or start from a blank device
fn open_image(
    image: Option<&path::Path>,
    map: &RegisterMap,
    device_id: Option<u8>,
) -> anyhow::Result<MemoryBus> {
    let mut bus = match image {
        Some(image) if image.is_file() => {
            let text = fs::read_to_string(image)
                .with_context(|| format!("could not read memory image {}", image.display()))?;
            MemoryBus::from_json_str(&text)
                .with_context(|| format!("could not parse memory image {}", image.display()))?
        }
        _ => MemoryBus::new(),
    };
    if let Some(select) = map.register(map.table_select()) {
        let location = (device_id.unwrap_or(select.device_id), select.offset);
        if bus.table_select().is_none() {
            bus = bus.with_table_select(location.0, location.1);
        }
        // The accessor starts out assuming table 0
        if bus.bank(location.0) != 0 {
            bus.write(location.0, location.1, &[0])?;
        }
        bus.clear_operations();
    }
    Ok(bus)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();

    let map = regmap::load_map(&cli.map)
        .with_context(|| format!("could not load register map {}", cli.map.display()))?;
    let bus = open_image(cli.image.as_deref(), &map, cli.device_id)?;

    let mut config = AccessorConfig::default();
    if let Some(device_id) = cli.device_id {
        config = config.device_id(device_id);
    }
    if cli.dummy {
        config = config.dummy(Settings::new());
    }
    let mut accessor = RegisterMapAccessor::new(bus, map, config);

    accessor.open()?;
    run(&mut accessor, &cli.command)?;
    accessor.close()?;

    if let Some(image) = &cli.image {
        fs::write(image, accessor.transport().to_json())
            .with_context(|| format!("could not write memory image {}", image.display()))?;
        debug!(
            "{} bus operation(s), image written to {}",
            accessor.transport().operations().len(),
            image.display()
        );
    }
    Ok(())
}

fn run(accessor: &mut RegisterMapAccessor<MemoryBus>, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Resolve { names } => {
            for name in names {
                let location = accessor.resolve(name)?;
                println!("{name}: {location}");
            }
        }
        Command::Get { names } => {
            let values = accessor.read_fields(names)?;
            values.write_to(io::stdout().lock())?;
        }
        Command::Set { assignments } => {
            accessor.write_fields(assignments.iter().map(|(name, value)| (name, *value)))?;
        }
        Command::Save { file, names } => {
            let names = names.iter().map(String::as_str).collect::<Vec<_>>();
            let names = (!names.is_empty()).then_some(names.as_slice());
            accessor
                .save_registers_to_path(file, names)
                .with_context(|| format!("could not save settings to {}", file.display()))?;
        }
        Command::Load { file } => {
            let settings = accessor
                .load_registers_from_path(file)
                .with_context(|| format!("could not load settings from {}", file.display()))?;
            accessor.write_fields(&settings)?;
            println!("regmap: applied {} setting(s)", settings.len());
        }
        Command::NonDefault { tables } => non_default(accessor, tables)?,
        Command::Sequence { name } => {
            if accessor.map().chip_sequence(name).is_none() {
                return Err(anyhow!("no chip sequence called {name} in register map"));
            }
            accessor.apply_sequence(name)?;
        }
        Command::Ls { sorting } => ls(accessor.map(), *sorting),
    }
    Ok(())
}

fn non_default(
    accessor: &mut RegisterMapAccessor<MemoryBus>,
    tables: &[u8],
) -> anyhow::Result<()> {
    let filter = if tables.is_empty() {
        FieldFilter::all()
    } else {
        FieldFilter::all().tables(tables.iter().copied())
    };
    let changed = accessor.non_default_fields(&filter, |event| match event {
        ScanEvent::Visited {
            name,
            value,
            reset_value,
        } => debug!("{name} = {value:#x} (reset {reset_value:#x})"),
        ScanEvent::Finished {
            visited,
            non_default,
        } => eprintln!("regmap: {non_default} of {visited} writable field(s) differ from reset"),
    })?;
    changed.write_to(io::stdout().lock())?;
    Ok(())
}

fn ls(map: &RegisterMap, sorting: Sorting) {
    let mut registers = map.registers().iter().collect::<Vec<_>>();
    match sorting {
        Sorting::Preserve => { /* do nothing */ }
        Sorting::Alpha => registers.sort_by(|a, b| a.name.cmp(&b.name)),
        Sorting::Address => {
            registers.sort_by_key(|r| (regmap::coerce_to_table_zero(r.table), r.offset));
        }
    }
    let longest = registers.iter().map(|r| r.name.len()).max().unwrap_or(0);
    for register in registers {
        let fields = map
            .bit_fields()
            .iter()
            .filter(|f| f.register == register.name)
            .count();
        let table = register.table.to_string();
        println!(
            "{: <longest$} device {:#04x} table {table: <12} offset {:#06x} {fields} bit-field(s)",
            register.name, register.device_id, register.offset
        );
    }
    println!(
        "regmap: {} register(s), {} bit-field(s)",
        map.registers().len(),
        map.bit_fields().len()
    );
}
