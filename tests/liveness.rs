use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shmcast::control::LoopbackChannel;
use shmcast::process::ProcessProbe;
use shmcast::server::{Server, ServerConfig, ServerParts};
use shmcast::{Client, EngineState, Error};

/// Reports every pid alive until told otherwise.
#[derive(Default)]
struct SwitchProbe {
    dead: AtomicBool,
}

impl ProcessProbe for SwitchProbe {
    fn is_alive(&self, _pid: u32) -> bool {
        !self.dead.load(Ordering::Acquire)
    }
}

fn server_with_probe(
    dir: &tempfile::TempDir,
    scan_interval: Duration,
) -> shmcast::Result<(Server, Arc<SwitchProbe>)> {
    let probe = Arc::new(SwitchProbe::default());
    let server = Server::start_with(
        ServerConfig {
            tick: Duration::from_millis(5),
            scan_interval,
            ..ServerConfig::in_dir(dir.path())
        },
        ServerParts {
            probe: Arc::clone(&probe) as Arc<dyn ProcessProbe>,
            ..ServerParts::default()
        },
    )?;
    Ok((server, probe))
}

fn loopback_client(server: &Server) -> shmcast::Result<Client> {
    Client::with_channel(Box::new(LoopbackChannel::new(
        Arc::clone(server.table()),
        Arc::clone(server.latch()),
    )))
}

fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn periodic_scan_evicts_dead_peers_and_parks_producer() -> shmcast::Result<()> {
    let dir = tempfile::tempdir()?;
    let (server, probe) = server_with_probe(&dir, Duration::from_millis(20))?;
    let mut a = loopback_client(&server)?;
    let mut b = loopback_client(&server)?;
    a.start()?;
    b.start()?;
    a.wait(Duration::from_secs(2))?;

    probe.dead.store(true, Ordering::Release);
    let table = Arc::clone(server.table());
    eventually("dead peers evicted", || table.is_empty().unwrap_or(false));
    assert_eq!(table.running_accounting()?, (0, 0));
    assert_eq!(table.engine().state(), EngineState::Parked);

    // The evicted sessions' handles are gone for good.
    assert!(matches!(a.start(), Err(Error::NotConnected)));
    Ok(())
}

#[test]
fn requested_scan_runs_without_waiting_for_the_interval() -> shmcast::Result<()> {
    let dir = tempfile::tempdir()?;
    let (server, probe) = server_with_probe(&dir, Duration::from_secs(3600))?;
    let _client = loopback_client(&server)?;

    probe.dead.store(true, Ordering::Release);
    let before = server.monitor().scans();
    server.monitor().request_scan();
    eventually("requested scan", || server.monitor().scans() > before);
    assert!(server.table().is_empty()?);
    Ok(())
}

#[test]
fn deaf_peer_prompts_a_scan() -> shmcast::Result<()> {
    let dir = tempfile::tempdir()?;
    let (server, probe) = server_with_probe(&dir, Duration::from_secs(3600))?;
    let mut client = loopback_client(&server)?;
    client.start()?;
    probe.dead.store(true, Ordering::Release);

    // Never consuming wakes makes the next fanout find the signal pending.
    let table = Arc::clone(server.table());
    eventually("deaf peer eviction", || table.is_empty().unwrap_or(false));
    assert!(table.deaf_signal_count() >= 1);
    assert_eq!(table.running_accounting()?, (0, 0));
    Ok(())
}
