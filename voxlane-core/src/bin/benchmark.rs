//! Stream throughput benchmark: one writer thread, N blocking reader threads.

fn main() {
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use serde::Serialize;
    use std::path::PathBuf;
    use std::thread;
    use std::time::Instant;
    use tracing_subscriber::EnvFilter;
    use voxlane_core::{
        stream::StreamStatsSnapshot, ReaderPolicy, StartPolicy, Stream, VoxlaneError,
        WriterPolicy,
    };

    #[derive(Debug)]
    struct Args {
        capacity: usize,
        word_size: usize,
        readers: usize,
        words: usize,
        block: usize,
        policy: WriterPolicy,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Clone, Serialize)]
    struct ReaderResult {
        reader: usize,
        words_read: u64,
        reads: u64,
        overruns: u64,
        words_lost: u64,
        elapsed_ms: f64,
    }

    #[derive(Debug, Clone, Serialize)]
    struct Summary {
        capacity: usize,
        word_size: usize,
        block: usize,
        policy: WriterPolicy,
        words_written: usize,
        write_elapsed_ms: f64,
        write_words_per_sec: f64,
        total_overruns: u64,
        stream: StreamStatsSnapshot,
        readers: Vec<ReaderResult>,
    }

    fn parse_value<T: std::str::FromStr>(
        it: &mut impl Iterator<Item = String>,
        flag: &str,
    ) -> Result<T, String> {
        let Some(v) = it.next() else {
            return Err(format!("missing value for {flag}"));
        };
        v.parse::<T>()
            .map_err(|_| format!("invalid value for {flag}"))
    }

    fn parse_args() -> Result<Args, String> {
        let mut args = Args {
            capacity: 1 << 16,
            word_size: 2,
            readers: 4,
            words: 16_000 * 60,
            block: 320,
            policy: WriterPolicy::Blockable,
            output: None,
        };

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--capacity" => args.capacity = parse_value(&mut it, "--capacity")?,
                "--word-size" => args.word_size = parse_value(&mut it, "--word-size")?,
                "--readers" => {
                    args.readers = parse_value::<usize>(&mut it, "--readers")?.clamp(1, 64)
                }
                "--words" => args.words = parse_value(&mut it, "--words")?,
                "--block" => args.block = parse_value::<usize>(&mut it, "--block")?.max(1),
                "--policy" => {
                    let v: String = parse_value(&mut it, "--policy")?;
                    args.policy = match v.as_str() {
                        "nonblockable" => WriterPolicy::Nonblockable,
                        "blockable" => WriterPolicy::Blockable,
                        other => return Err(format!("unknown writer policy: {other}")),
                    };
                }
                "--output" => {
                    let v: String = parse_value(&mut it, "--output")?;
                    args.output = Some(PathBuf::from(v));
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p voxlane-core --release --bin benchmark -- \\
  [--capacity <words>] [--word-size <bytes>] [--readers <n>] [--words <n>] \\
  [--block <words>] [--policy nonblockable|blockable] [--output <file.json>]"
                    );
                    std::process::exit(0);
                }
                other => {
                    return Err(format!("unknown argument: {other}"));
                }
            }
        }
        Ok(args)
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voxlane_core=info")),
        )
        .init();

    let args = parse_args()?;
    let stream = Stream::create(args.capacity, args.word_size, args.readers)
        .map_err(|e| e.to_string())?;
    let writer = stream.create_writer(args.policy).map_err(|e| e.to_string())?;

    println!(
        "Running voxlane benchmark: {} words × {} bytes, capacity {}, {} readers, {:?}",
        args.words, args.word_size, args.capacity, args.readers, args.policy
    );

    let (result_tx, result_rx) = crossbeam_channel::unbounded::<ReaderResult>();
    let mut handles = Vec::with_capacity(args.readers);
    for _ in 0..args.readers {
        let reader = stream
            .create_reader(ReaderPolicy::Blocking, StartPolicy::Now)
            .map_err(|e| e.to_string())?;
        let tx = result_tx.clone();
        let block = args.block;
        let word_size = args.word_size;
        handles.push(thread::spawn(move || {
            let mut buf = vec![0u8; block * word_size];
            let mut result = ReaderResult {
                reader: reader.id(),
                words_read: 0,
                reads: 0,
                overruns: 0,
                words_lost: 0,
                elapsed_ms: 0.0,
            };
            let started = Instant::now();
            loop {
                let before = reader.tell();
                match reader.read(&mut buf, block) {
                    Ok(0) => break,
                    Ok(n) => {
                        result.words_read += n as u64;
                        result.reads += 1;
                    }
                    Err(VoxlaneError::Overrun { resume_at }) => {
                        result.overruns += 1;
                        result.words_lost += resume_at.saturating_sub(before);
                    }
                    Err(_) => break,
                }
            }
            result.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            let _ = tx.send(result);
        }));
    }
    drop(result_tx);

    let frame = vec![0x5Au8; args.block * args.word_size];
    let started = Instant::now();
    let mut written = 0usize;
    while written < args.words {
        let count = args.block.min(args.words - written);
        written += writer.write(&frame, count).map_err(|e| e.to_string())?;
    }
    let write_elapsed = started.elapsed();
    writer.close();

    for handle in handles {
        handle
            .join()
            .map_err(|_| "reader thread panicked".to_string())?;
    }
    let mut readers: Vec<ReaderResult> = result_rx.iter().collect();
    readers.sort_by_key(|r| r.reader);

    let write_secs = write_elapsed.as_secs_f64();
    let summary = Summary {
        capacity: args.capacity,
        word_size: args.word_size,
        block: args.block,
        policy: args.policy,
        words_written: written,
        write_elapsed_ms: write_secs * 1000.0,
        write_words_per_sec: if write_secs > 0.0 {
            written as f64 / write_secs
        } else {
            0.0
        },
        total_overruns: readers.iter().map(|r| r.overruns).sum(),
        stream: stream.stats(),
        readers,
    };

    println!(
        "Done. written={} in {:.1}ms ({:.0} words/s), overruns={}",
        summary.words_written,
        summary.write_elapsed_ms,
        summary.write_words_per_sec,
        summary.total_overruns
    );

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&out, json).map_err(|e| e.to_string())?;
        println!("Wrote benchmark report: {}", out.display());
    } else {
        println!("{json}");
    }

    Ok(())
}
