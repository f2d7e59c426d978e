use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::SIGINT;

use shmkv::{Store, StoreConfig};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmkv.toml")]
    config: String,
    /// Keep writing a heartbeat key until ctrl-c instead of exiting
    /// after the scripted checks.
    #[clap(long)]
    linger: bool,
    /// Leave the segment in place on exit instead of deleting it.
    #[clap(long)]
    keep: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct DemoConfig {
    store: StoreConfig,
}

fn check(what: &str, ok: bool) {
    if ok {
        println!("ok: {}", what);
    } else {
        eprintln!("FAILED: {}", what);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: DemoConfig = confy::load_path(&opts.config)?;
    println!("{:?}", &cfg.store);

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&interrupted))?;

    let mut store = Store::create(&cfg.store)?;
    run_checks(&mut store)?;

    if opts.linger {
        linger(&mut store, &interrupted)?;
    }

    if opts.keep {
        println!("Keeping segment '{}'", store.name());
    } else {
        println!("Deleting segment '{}'", store.name());
        store.delete();
    }
    Ok(())
}

fn run_checks(store: &mut Store) -> Result<(), Box<dyn Error>> {
    check("read of a missing key", store.read(b"foo")?.is_none());

    store.write(b"foo", b"bar")?;
    check(
        "simple write then read",
        store.read(b"foo")?.as_deref() == Some(&b"bar"[..]),
    );

    let artist: &[u8] = b"Bob Dylan";
    let songs: [&[u8]; 3] = [
        b"Boots of Spanish Leather",
        b"It Ain't Me Babe",
        b"Don't Think Twice It's Alright",
    ];
    for song in &songs {
        store.write(artist, song)?;
    }
    let all = store.read_all(artist)?;
    check(
        "read_all over duplicate writes",
        all.len() == songs.len() && all.iter().zip(songs.iter()).all(|(a, b)| a == b),
    );
    check(
        "single read restarts the cycle",
        store.read(artist)?.as_deref() == Some(songs[0]),
    );
    Ok(())
}

fn linger(store: &mut Store, interrupted: &AtomicBool) -> Result<(), Box<dyn Error>> {
    println!("Lingering, ctrl-c to tear down");
    let mut beat = 0u64;
    while !interrupted.load(Ordering::Relaxed) {
        store.write(b"heartbeat", beat.to_string().as_bytes())?;
        beat += 1;
        thread::sleep(Duration::from_millis(500));
    }
    println!("\nInterrupted after {} heartbeats", beat);
    Ok(())
}
