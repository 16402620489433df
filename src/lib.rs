//! Locate the load address of a flat firmware image by correlating the file
//! offsets of embedded strings with decoded pointer values modulo a set of
//! pairwise-coprime moduli, then reconstructing the full-width base via the
//! Chinese remainder theorem.

pub mod correlate;
pub mod crt;
pub mod errors;
pub mod moduli;
pub mod noise;
pub mod residue;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use clap::App;
use fnv::FnvHashSet;
use num_bigint::BigUint;
use num_traits::One;
use pbr::ProgressBar;
use std::fs::File;
use std::io::prelude::*;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::correlate::{cross_correlate, top_peaks, ModulusPeaks, TOP_PEAKS};
use crate::crt::combine;
use crate::moduli::{select_moduli, EXTRA_MODULI};
use crate::noise::NoiseModel;
use crate::residue::residue_vector;

pub use crate::crt::{Estimate, Offset};
pub use crate::errors::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Everything the scan needs besides the image itself.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Minimum string length in codepoints.
    pub min_str_len: u32,
    /// Pointer width in bytes; implies a 2^(8*width) address space.
    pub ptr_len: u32,
    pub endian: Endianness,
    /// Alignment of candidate pointer slots in the file.
    pub align: u32,
    /// Multiplier on the minimum modulus size. Larger means bigger vectors
    /// but a lower noise floor.
    pub slack: f64,
    pub threads: usize,
}

impl ScanOptions {
    fn validate(&self) -> Result<(), Error> {
        if self.min_str_len == 0 {
            return Err(Error::Input("minimum string length must be at least 1".into()));
        }
        if ![1, 2, 4, 8].contains(&self.ptr_len) {
            return Err(Error::Input(format!(
                "unsupported pointer width {} (expected 1, 2, 4 or 8)",
                self.ptr_len
            )));
        }
        if self.align == 0 {
            return Err(Error::Input("alignment must be at least 1".into()));
        }
        if !self.slack.is_finite() || self.slack < 1.0 {
            return Err(Error::Input("slack factor must be a finite value >= 1.0".into()));
        }
        Ok(())
    }
}

pub struct Config {
    pub filename: String,
    pub options: ScanOptions,
}

impl Config {
    pub fn new() -> Result<Config, Error> {
        let arg_matches = App::new("basecorr")
            .version("0.1.0")
            .about(
                "Scan a flat firmware image and recover its base address by \
                 correlating string offsets with pointer values modulo a set of \
                 coprime moduli. Based on the excellent allyourbase.py.",
            )
            .args_from_usage(
                "<INPUT>                'The input binary to scan'
                -n, --minstrlen=[LEN]   'Minimum string length in codepoints (default is 5)'
                -l, --ptrlen=[LEN]      'Pointer width in bytes: 1, 2, 4 or 8 (default is 8)'
                -e, --endian=[ORDER]    'Pointer byte order: little or big (default is little)'
                -a, --align=[ALIGN]     'Alignment of pointer slots in bytes (default is the pointer width)'
                -f, --slack=[FACTOR]    'Slack factor; larger lowers the noise floor at more memory cost'
                -t, --threads=[NUM]     '# of worker threads (default is # of cpu cores)'",
            )
            .get_matches();

        let min_str_len = arg_matches
            .value_of("minstrlen")
            .unwrap_or("5")
            .parse::<u32>()
            .map_err(|_| Error::Input("failed to parse minstrlen".into()))?;
        let ptr_len = arg_matches
            .value_of("ptrlen")
            .unwrap_or("8")
            .parse::<u32>()
            .map_err(|_| Error::Input("failed to parse ptrlen".into()))?;
        let endian = match arg_matches.value_of("endian").unwrap_or("little") {
            "little" => Endianness::Little,
            "big" => Endianness::Big,
            other => {
                return Err(Error::Input(format!(
                    "unsupported endianness '{}' (expected little or big)",
                    other
                )))
            }
        };
        let align = match arg_matches.value_of("align") {
            Some(s) => s
                .parse::<u32>()
                .map_err(|_| Error::Input("failed to parse align".into()))?,
            None => ptr_len,
        };
        let slack = match arg_matches.value_of("slack") {
            Some(s) => s
                .parse::<f64>()
                .map_err(|_| Error::Input("failed to parse slack".into()))?,
            None => noise::default_slack(align.max(1)),
        };
        let threads = match arg_matches.value_of("threads").unwrap_or("0").parse::<usize>() {
            Ok(0) => num_cpus::get(),
            Ok(v) => v,
            Err(_) => return Err(Error::Input("failed to parse threads".into())),
        };

        let config = Config {
            filename: arg_matches.value_of("INPUT").unwrap().to_string(),
            options: ScanOptions {
                min_str_len,
                ptr_len,
                endian,
                align,
                slack,
                threads,
            },
        };
        config.options.validate()?;
        Ok(config)
    }
}

/// Offsets of NUL-terminated runs of at least `min_len` codepoints, where a
/// codepoint is printable ASCII (plus tab/newline/CR/FF) or a plausible
/// multi-byte UTF-8 sequence. Overlong encodings slip through; this is a
/// heuristic, not a validator.
fn get_strings(buffer: &[u8], min_len: u32) -> Result<FnvHashSet<u64>, Error> {
    let mut strings = FnvHashSet::default();

    let reg_str = format!(
        "(?-u)(?:[\\t\\n\\x0c\\r\\x20-\\x7e]|[\\xc2-\\xdf][\\x80-\\xbf]|[\\xe0-\\xef][\\x80-\\xbf]{{2}}|[\\xf0-\\xf4][\\x80-\\xbf]{{3}}){{{},}}\\x00",
        min_len
    );
    let re = regex::bytes::Regex::new(&reg_str)
        .map_err(|e| Error::Internal(format!("string regex: {}", e)))?;
    for mat in re.find_iter(buffer) {
        strings.insert(mat.start() as u64);
    }

    Ok(strings)
}

/// Decodes every aligned slot as a pointer and collects the distinct target
/// values. Naive by design: false pointers only raise the noise floor.
fn get_pointers(buffer: &[u8], options: &ScanOptions) -> FnvHashSet<u64> {
    let mut pointers = FnvHashSet::default();
    let width = options.ptr_len as usize;
    let align = options.align as usize;
    if buffer.len() < width {
        return pointers;
    }
    let mut i = 0;
    while i + width <= buffer.len() {
        let value = match options.endian {
            Endianness::Little => LittleEndian::read_uint(&buffer[i..i + width], width),
            Endianness::Big => BigEndian::read_uint(&buffer[i..i + width], width),
        };
        pointers.insert(value);
        i += align;
    }
    pointers
}

fn correlate_all(
    strings: FnvHashSet<u64>,
    pointers: FnvHashSet<u64>,
    moduli: Vec<u64>,
    threads: usize,
) -> Result<Vec<ModulusPeaks>, Error> {
    let total = moduli.len();
    let workers = threads.max(1).min(total);
    let strings = Arc::new(strings);
    let pointers = Arc::new(pointers);
    let moduli = Arc::new(moduli);
    let progress = Arc::new(Mutex::new(ProgressBar::on(std::io::stderr(), total as u64)));

    let mut children = Vec::with_capacity(workers);
    for worker in 0..workers {
        let strings = Arc::clone(&strings);
        let pointers = Arc::clone(&pointers);
        let moduli = Arc::clone(&moduli);
        let progress = Arc::clone(&progress);
        children.push(thread::spawn(
            move || -> Result<Vec<(usize, ModulusPeaks)>, Error> {
                let mut out = Vec::new();
                let mut idx = worker;
                while idx < moduli.len() {
                    let modulus = moduli[idx];
                    let x = residue_vector(&strings, modulus)?;
                    let y = residue_vector(&pointers, modulus)?;
                    let corr = cross_correlate(&x, &y)?;
                    let model = NoiseModel::new(strings.len(), pointers.len(), modulus);
                    let peaks = top_peaks(&corr, TOP_PEAKS, &model);
                    out.push((idx, ModulusPeaks { modulus, peaks }));
                    if let Ok(mut pb) = progress.lock() {
                        pb.inc();
                    }
                    idx += workers;
                }
                Ok(out)
            },
        ));
    }

    let mut indexed = Vec::with_capacity(total);
    for child in children {
        let partial = child
            .join()
            .map_err(|_| Error::Internal("worker thread panicked".into()))?;
        indexed.extend(partial?);
    }
    if let Ok(mut pb) = progress.lock() {
        pb.finish();
    }
    indexed.sort_by_key(|&(idx, _)| idx);
    Ok(indexed.into_iter().map(|(_, peaks)| peaks).collect())
}

/// Runs the whole pipeline on an in-memory image.
pub fn scan(buffer: &[u8], options: &ScanOptions) -> Result<Estimate, Error> {
    options.validate()?;

    let strings = get_strings(buffer, options.min_str_len)?;
    if strings.is_empty() {
        return Err(Error::InsufficientData(
            "no strings found in target image".into(),
        ));
    }
    println!("Found {} strings", strings.len());

    let pointers = get_pointers(buffer, options);
    if pointers.is_empty() {
        return Err(Error::InsufficientData(
            "image holds no pointer-sized slots".into(),
        ));
    }
    eprintln!("Located {} candidate pointer targets", pointers.len());

    let file_len = buffer.len() as u64;
    let address_space = BigUint::one() << (8 * options.ptr_len as usize);
    // Every modulus must exceed the file length so distinct offsets cannot
    // collide before the correlation even runs; the slack factor pushes them
    // further up to thin out the noise floor.
    let min_modulus = ((file_len as f64) * options.slack).ceil() as u64;
    let reach = address_space.clone() + BigUint::from(file_len);
    let chosen = select_moduli(min_modulus.max(file_len).max(1), &reach, EXTRA_MODULI)?;

    let per_modulus = correlate_all(strings, pointers, chosen, options.threads)?;
    combine(&per_modulus, &address_space, file_len)
}

pub fn run(config: &Config) -> Result<(), Error> {
    // Read in the input file. We jam it all into memory for now.
    let mut f = File::open(&config.filename)?;
    let mut buffer = Vec::new();
    f.read_to_end(&mut buffer)?;

    let estimate = scan(&buffer, &config.options)?;
    println!("Confidence: {}/{}", estimate.agreed, estimate.total);
    println!("Offset: {}", estimate.offset);
    Ok(())
}
