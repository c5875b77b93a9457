use std::error::Error;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use p8asm::{
    asm::{Asm, Outcome, MAX_PASSES},
    lexer::Lexer,
    Dialect, SymTab,
};
use tracing::Level;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Assembly source file
    source: PathBuf,

    /// Output file; a `.po`/`.rim` extension also selects the format
    output: Option<PathBuf>,

    /// Accept PAL-D syntax (string and character literals)
    #[arg(short = 'D', long)]
    pal_d: bool,

    /// Use the alternate MK12 symbol table
    #[arg(long)]
    mk: bool,

    /// Write object (.po) output
    #[arg(long)]
    pobj: bool,

    /// Write RIM paper tape (.rim) output
    #[arg(long)]
    rim: bool,

    /// Print a loader URL
    #[arg(long)]
    url: bool,

    /// Base URL for the URL output (implies --url)
    #[arg(long, value_name = "URL")]
    url_base: Option<String>,

    /// Dump the program listing to stdout
    #[arg(long)]
    dump: bool,

    /// Write a program listing (.lst) file
    #[arg(long)]
    list: bool,

    /// Print program size information
    #[arg(long)]
    size: bool,

    /// Lines of context surrounding reported errors
    #[arg(long, default_value_t = 0)]
    err_ctx: usize,

    /// One of `TRACE`, `DEBUG`, `INFO`, `WARN`, or `ERROR`
    #[arg(short, long, default_value_t = Level::INFO)]
    log_level: Level,
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(io::stderr)
        .init();

    match main_real(args) {
        Ok(code) => code,
        // fatal lexical and i/o errors get their own exit code, before any
        // output is produced
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(2)
        }
    }
}

fn main_real(mut args: Args) -> Result<ExitCode, Box<dyn Error>> {
    // an output extension we recognize selects the format; one we don't is
    // kept verbatim
    let mut custom_ext = false;
    let out_stem = match args.output.clone() {
        Some(path) => match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("rim") || ext.eq_ignore_ascii_case("rm") => {
                args.rim = true;
                path.with_extension("")
            }
            Some(ext) if ext.eq_ignore_ascii_case("po") || ext.eq_ignore_ascii_case("pobj") => {
                args.pobj = true;
                path.with_extension("")
            }
            _ => {
                custom_ext = true;
                path
            }
        },
        None => args.source.with_extension(""),
    };

    if args.url_base.is_some() {
        args.url = true;
    }
    if !args.pobj && !args.rim && !args.url && !args.dump {
        // pobj is the default because it's human readable
        args.pobj = true;
    }

    let dialect = if args.pal_d {
        Dialect::PalD
    } else {
        Dialect::Pal3
    };
    let symtab = if args.mk { SymTab::mk() } else { SymTab::pal() };

    let file = File::open(&args.source)
        .map_err(|e| format!("cant open file {}: {e}", args.source.display()))?;
    let lexer = Lexer::new(file, dialect)?;
    let mut asm = Asm::new(lexer, symtab);

    if let Outcome::MaxPasses = asm.assemble()? {
        tracing::warn!("assembly did not converge after {MAX_PASSES} passes");
    }
    if asm.has_errors() {
        asm.print_errors(args.err_ctx)?;
        return Ok(ExitCode::FAILURE);
    }

    if args.dump {
        asm.memory()
            .export_listing(&mut io::stdout().lock(), asm.listing(), asm.tags())?;
    }

    if args.pobj {
        let path = out_path(&out_stem, "po", custom_ext);
        tracing::info!("writing object file {}", path.display());
        let mut out = BufWriter::new(File::create(&path)?);
        asm.memory().export_pobj(&mut out)?;
    }

    if args.rim {
        let path = out_path(&out_stem, "rim", custom_ext);
        tracing::info!("writing RIM file {}", path.display());
        let mut out = BufWriter::new(File::create(&path)?);
        asm.memory().export_rim(&mut out)?;
    }

    if args.url {
        let base = args.url_base.unwrap_or_default();
        println!("{}", asm.memory().export_url(&base));
    }

    if args.list {
        let path = args.source.with_extension("lst");
        tracing::info!("writing program listing {}", path.display());
        let mut out = BufWriter::new(File::create(&path)?);
        asm.memory()
            .export_listing(&mut out, asm.listing(), asm.tags())?;
    }

    if args.size {
        println!("{}", asm.memory().export_size());
    }

    Ok(ExitCode::SUCCESS)
}

fn out_path(stem: &Path, ext: &str, custom_ext: bool) -> PathBuf {
    if custom_ext {
        stem.to_path_buf()
    } else {
        stem.with_extension(ext)
    }
}
