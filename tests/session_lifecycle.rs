use std::sync::Arc;
use std::time::{Duration, Instant};

use shmcast::control::LoopbackChannel;
use shmcast::server::{Server, ServerConfig, ServerParts};
use shmcast::{Client, EngineState, Error, QuantaClock};

fn fast_server(dir: &tempfile::TempDir) -> shmcast::Result<Server> {
    Server::start(ServerConfig {
        tick: Duration::from_millis(5),
        scan_interval: Duration::from_millis(20),
        ..ServerConfig::in_dir(dir.path())
    })
}

fn loopback_client(server: &Server) -> shmcast::Result<Client> {
    Client::with_channel(Box::new(LoopbackChannel::new(
        Arc::clone(server.table()),
        Arc::clone(server.latch()),
    )))
}

fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn loopback_client_streams_frames() -> shmcast::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut server = fast_server(&dir)?;
    let mut client = loopback_client(&server)?;
    assert_eq!(server.table().len()?, 1);

    let report = client.stream(6, Duration::from_secs(2))?;
    assert_eq!(report.wakes, 6);
    assert!(report.observations > 0);
    assert!(report.stats[0].observed > 0);
    assert_eq!(server.table().running_accounting()?, (0, 0));
    assert_eq!(server.table().engine().state(), EngineState::Parked);

    // Parked streams read as disarmed once the producer thread settles.
    eventually("streams disarmed", || {
        client
            .reader()
            .view()
            .streams()
            .iter()
            .all(|s| s.latest_index().is_none())
    });

    client.disconnect()?;
    assert!(server.table().is_empty()?);
    server.shutdown()?;
    Ok(())
}

#[test]
fn producer_runs_while_any_session_runs() -> shmcast::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = fast_server(&dir)?;
    let mut first = loopback_client(&server)?;
    let mut second = loopback_client(&server)?;

    first.start()?;
    second.start()?;
    assert_eq!(server.table().running_accounting()?, (2, 2));

    first.stop()?;
    assert_eq!(server.table().engine().state(), EngineState::Active);
    second.wait(Duration::from_secs(2))?;

    second.stop()?;
    assert_eq!(server.table().running_accounting()?, (0, 0));
    assert_eq!(server.table().engine().state(), EngineState::Parked);
    assert_eq!(server.table().activity().edges(), (1, 1));
    Ok(())
}

#[test]
fn start_and_stop_are_checked_per_session() -> shmcast::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = fast_server(&dir)?;
    let mut client = loopback_client(&server)?;

    assert!(matches!(client.stop(), Err(Error::NotRunning)));
    client.start()?;
    assert!(matches!(client.start(), Err(Error::AlreadyRunning)));
    assert_eq!(server.table().running_accounting()?, (1, 1));
    client.stop()?;
    Ok(())
}

#[test]
fn full_table_rejects_connect() -> shmcast::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = Server::start(ServerConfig {
        max_sessions: 2,
        ..ServerConfig::in_dir(dir.path())
    })?;
    let _a = loopback_client(&server)?;
    let _b = loopback_client(&server)?;
    let err = loopback_client(&server).err().expect("third session rejected");
    assert!(matches!(err, Error::CapacityExceeded(2)));
    assert_eq!(server.table().len()?, 2);
    Ok(())
}

#[test]
fn dropped_loopback_session_is_reclaimed() -> shmcast::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = fast_server(&dir)?;
    let mut client = loopback_client(&server)?;
    client.start()?;
    drop(client);

    let table = Arc::clone(server.table());
    eventually("orphaned session eviction", || {
        table.is_empty().unwrap_or(false)
    });
    assert_eq!(table.running_accounting()?, (0, 0));
    assert_eq!(table.engine().state(), EngineState::Parked);
    Ok(())
}

#[test]
fn shutdown_evicts_sessions_and_refuses_new_ones() -> shmcast::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut server = fast_server(&dir)?;
    let mut client = loopback_client(&server)?;
    client.start()?;
    let table = Arc::clone(server.table());

    server.shutdown()?;
    assert!(table.is_empty()?);
    assert_eq!(table.segment().running(), 0);
    assert_eq!(table.engine().state(), EngineState::Shutdown);
    assert!(matches!(loopback_client(&server), Err(Error::Transport(_))));
    Ok(())
}

#[test]
fn tsc_clock_timestamps_compare_with_the_reader() -> shmcast::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = Server::start_with(
        ServerConfig {
            tick: Duration::from_millis(5),
            ..ServerConfig::in_dir(dir.path())
        },
        ServerParts {
            clock: Arc::new(QuantaClock::new()),
            ..ServerParts::default()
        },
    )?;
    let mut client = loopback_client(&server)?;

    let mut seen = Vec::new();
    client.start()?;
    for _ in 0..4 {
        seen.extend(client.wait(Duration::from_secs(2))?);
    }
    client.stop()?;

    assert!(!seen.is_empty());
    // Both clocks read CLOCK_MONOTONIC seconds, so frames land under the floor.
    assert!(seen.iter().all(|o| o.counted));
    assert!(client.reader().stats(0).observed > 0);
    client.disconnect()?;
    Ok(())
}
