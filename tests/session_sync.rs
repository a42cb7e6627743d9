use std::time::{Duration, Instant};

use flightdeck::config::Config;
use flightdeck::engine::{Engine, EngineError, EngineEvent, SessionLink};
use flightdeck::journal::Journal;
use flightdeck::plugin::builtin::{PulseTask, SurveyTask};
use flightdeck::session::{HostLink, ParticipantLink, SessionError};
use flightdeck::transport::{pair, TransportPair};

fn fast_config() -> Config {
    Config {
        tick_floor: Duration::from_millis(1),
        pause_exchange_interval: Duration::from_millis(1),
        connection_timeout: Duration::from_millis(500),
        termination_grace: Duration::from_millis(500),
        ..Config::default()
    }
}

const SHORT_SCENARIO: &str = "0:00:00;pulse;start\n0:00:01;end\n";
const LONG_SCENARIO: &str = "0:00:00;pulse;start\n0:01:00;end\n";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn host_and_participant_run_to_agreement() {
    let TransportPair { client, server } = pair();

    let (host_journal, host_records) = Journal::memory();
    let mut host = Engine::new(
        fast_config(),
        host_journal,
        SessionLink::Host(HostLink::new(Box::new(server), Duration::from_millis(1500))),
    );
    host.register(PulseTask::boxed()).unwrap();
    host.load_scenario(SHORT_SCENARIO, "demo.txt").unwrap();

    let (part_journal, part_records) = Journal::memory();
    let mut participant = Engine::new(
        fast_config(),
        part_journal,
        SessionLink::Participant(ParticipantLink::new(Box::new(client))),
    );
    participant.register(PulseTask::boxed()).unwrap();
    participant.load_scenario(SHORT_SCENARIO, "demo.txt").unwrap();

    let host_task = tokio::spawn(async move {
        host.connect().await?;
        host.run().await
    });
    let participant_task = tokio::spawn(async move {
        participant.connect().await?;
        participant.run().await
    });

    tokio::time::timeout(Duration::from_secs(10), async {
        host_task.await.unwrap().unwrap();
        participant_task.await.unwrap().unwrap();
    })
    .await
    .expect("session did not complete in time");

    assert_eq!(
        host_records.count_with_prefix(&["SESSION", "INFO", "CONNECTED"]),
        1
    );
    assert_eq!(
        host_records.count_with_prefix(&["MAIN", "STATE", "", "END"]),
        1
    );
    assert_eq!(
        part_records.count_with_prefix(&["MAIN", "STATE", "", "END"]),
        1
    );
    // ~1 s of a 200 ms update interval on the host side.
    assert!(host_records.count_with_prefix(&["PULSE", "TICK"]) >= 3);
    assert_eq!(host_records.count_with_prefix(&["SESSION", "ERROR"]), 0);
    assert_eq!(part_records.count_with_prefix(&["SESSION", "PROTOCOL"]), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn host_tears_down_without_any_participant_contact() {
    let TransportPair { client: _silent, server } = pair();

    let (journal, records) = Journal::memory();
    let mut host = Engine::new(
        fast_config(),
        journal,
        SessionLink::Host(HostLink::new(Box::new(server), Duration::from_millis(300))),
    );
    host.register(PulseTask::boxed()).unwrap();
    host.load_scenario(SHORT_SCENARIO, "demo.txt").unwrap();

    let started = Instant::now();
    let err = host.connect().await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(
        err,
        EngineError::Session(SessionError::ConnectionTimeout(_))
    ));
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(records.count_with_prefix(&["SESSION", "ERROR", "CONNECT"]), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn host_ends_when_a_connected_participant_goes_silent() {
    let TransportPair { client, server } = pair();

    let (journal, records) = Journal::memory();
    let mut host = Engine::new(
        fast_config(),
        journal,
        SessionLink::Host(HostLink::new(Box::new(server), Duration::from_millis(200))),
    );
    host.register(PulseTask::boxed()).unwrap();
    host.load_scenario(LONG_SCENARIO, "demo.txt").unwrap();

    let link = ParticipantLink::new(Box::new(client));
    let participant = tokio::spawn(async move {
        link.confirm_connected().await.unwrap();
        // Fall silent; the link drops here.
    });

    host.connect().await.unwrap();
    participant.await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), host.run())
        .await
        .expect("heartbeat expiry did not end the session")
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Session(SessionError::ConnectionTimeout(_))
    ));
    assert_eq!(
        records.count_with_prefix(&["SESSION", "ERROR", "HEARTBEAT", "TIMEOUT"]),
        1
    );
    // Teardown is orderly: the closing journal record still lands.
    assert_eq!(records.count_with_prefix(&["MAIN", "STATE", "", "END"]), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_pausing_task_defers_its_siblings_at_the_same_instant() {
    let (journal, records) = Journal::memory();
    let mut engine = Engine::new(fast_config(), journal, SessionLink::Local);
    engine.register(PulseTask::boxed()).unwrap();
    engine.register(SurveyTask::boxed()).unwrap();
    engine
        .load_scenario(
            "0:00:00-9;survey;start\n\
             0:00:00;pulse;start\n\
             0:00:01;end\n",
            "inline",
        )
        .unwrap();
    let events = engine.events();

    let run = tokio::spawn(async move { engine.run().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(records.count_with_prefix(&["SURVEY", "STATE", "SHOW"]), 1);
    assert_eq!(
        records.count_with_prefix(&["MAIN", "STATE", "PULSE", "START"]),
        0,
        "the pulse start raced past the pause barrier"
    );

    events.send(EngineEvent::Resume);
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run did not finish")
        .unwrap()
        .unwrap();

    let all = records.records();
    let resume_at = all
        .iter()
        .position(|record| record == &["MAIN", "STATE", "", "RESUME"])
        .expect("no resume record");
    let pulse_start_at = all
        .iter()
        .position(|record| record == &["MAIN", "STATE", "PULSE", "START"])
        .expect("no pulse start record");
    assert!(resume_at < pulse_start_at);
}
