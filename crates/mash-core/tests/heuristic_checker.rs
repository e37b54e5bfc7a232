use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use mash_core::{
    MemoryMailer, ScheduledTask, SchedulerConfig, Services, TaskEngine, tasks::HeuristicChecker,
};
use mash_model::{
    Alert, HeuristicStatus, HeuristicTestStatus, HeuristicVersion, JobRecord, JobStatus,
    PluginErrorReport, PluginErrorType, Server, ServerType, Store, TestPhase,
};
use mash_net::{Action, Listener, Message, Session};
use tokio_util::sync::CancellationToken;

const SOURCE: &[u8] = b"class Detector {};\n";

/// Answers `CHECK_HEURISTIC` with the configured results, in order.
struct MockCompilationServer {
    results: Vec<Message>,
}

#[async_trait]
impl Listener for MockCompilationServer {
    async fn handle_command(&mut self, session: &mut Session, command: &Message) -> Action {
        match command.name.as_str() {
            "STATUS" => session.send_response(&Message::new("READY")).await.unwrap(),
            "CHECK_HEURISTIC" => {
                for result in &self.results {
                    session.send_response(result).await.unwrap();
                }
            }
            "LOGS" => session.send_response(&Message::new("END_LOGS")).await.unwrap(),
            "DONE" => {
                let _ = session.send_response(&Message::new("GOODBYE")).await;
                return Action::CloseConnection;
            }
            _ => session.send_response(&Message::new("OK")).await.unwrap(),
        }
        Action::None
    }
}

struct Setup {
    store: Store,
    config: SchedulerConfig,
    heuristic: HeuristicVersion,
    mailer: Arc<MemoryMailer>,
    stop: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Drop for Setup {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn setup(results: Vec<Message>) -> Setup {
    let mut server = mash_net::Server::new("CompilationServer", 0);
    let port = server.listen("127.0.0.1", 0).unwrap().port();
    let stop = server.stop_token();
    tokio::spawn(async move {
        server
            .run(Arc::new(move || {
                Box::new(MockCompilationServer {
                    results: results.clone(),
                }) as Box<dyn Listener>
            }))
            .await
    });

    let dir = tempfile::tempdir().unwrap();
    let config = SchedulerConfig {
        log_files_root: dir.path().join("logs"),
        upload_repository: dir.path().join("upload"),
        heuristics_repository: dir.path().join("heuristics"),
        upload_repository_url: "git://mash/upload.git".into(),
        response_timeout_secs: 5,
        ..Default::default()
    };
    std::fs::create_dir_all(config.upload_repository.join("user1")).unwrap();
    std::fs::write(config.upload_repository.join("user1/upload_42.cpp"), SOURCE).unwrap();

    let store = Store::new();
    store
        .insert(Server {
            name: "compilation".into(),
            address: "127.0.0.1".into(),
            port,
            server_type: ServerType::Compilation,
            ..Default::default()
        })
        .unwrap();
    let heuristic = store
        .insert(HeuristicVersion {
            author: "User1".into(),
            name: "Edge Detector".into(),
            version: 2,
            filename: "upload_42.cpp".into(),
            ..Default::default()
        })
        .unwrap();

    Setup {
        store,
        config,
        heuristic,
        mailer: Arc::new(MemoryMailer::new()),
        stop,
        _dir: dir,
    }
}

async fn run_checker(setup: &Setup) -> Vec<Message> {
    let services = Services::new(
        setup.store.clone(),
        setup.config.clone(),
        setup.mailer.clone(),
    );
    let mut engine = TaskEngine::new(HeuristicChecker, services);
    engine.start().await;

    let mut events = Vec::new();
    for _ in 0..200 {
        if engine.jobs().is_empty() {
            break;
        }
        let _ = tokio::time::timeout(Duration::from_millis(100), engine.wait_readable()).await;
        engine.on_event(0).await;
        events.extend(engine.take_events().await);
    }
    assert!(engine.jobs().is_empty(), "the check did not finish");
    events.extend(engine.take_events().await);
    events
}

#[tokio::test]
async fn checked_heuristic_moves_to_the_repository() {
    let setup = setup(vec![
        Message::new("COMPILATION_OK"),
        Message::new("ANALYZE_OK"),
        Message::new("TEST_OK"),
    ]);

    let events = run_checker(&setup).await;
    assert_eq!(
        events,
        vec![Message::new("EVT_HEURISTIC_CHECKED").arg(setup.heuristic.id)]
    );

    let hv = setup.store.get::<HeuristicVersion>(setup.heuristic.id).unwrap();
    assert!(hv.checked);
    assert_eq!(hv.status, HeuristicStatus::Ok);
    assert_eq!(hv.filename, "edge-detector_v2.cpp");

    let moved = setup.config.heuristics_repository.join("user1/edge-detector_v2.cpp");
    assert_eq!(std::fs::read(moved).unwrap(), SOURCE);
    assert!(!setup.config.upload_repository.join("user1").exists());

    assert!(setup.store.all::<HeuristicTestStatus>().is_empty());
    assert_eq!(setup.store.all::<JobRecord>()[0].status, JobStatus::Done);
}

#[tokio::test]
async fn compilation_error_disables_the_heuristic() {
    let setup = setup(vec![Message::new("COMPILATION_ERROR").arg("missing ';'")]);

    let events = run_checker(&setup).await;
    assert!(events.is_empty());

    let hv = setup.store.get::<HeuristicVersion>(setup.heuristic.id).unwrap();
    assert!(!hv.checked);
    assert_eq!(hv.status, HeuristicStatus::Disabled);

    let status = setup.store.all::<HeuristicTestStatus>().pop().unwrap();
    assert_eq!(status.phase, TestPhase::Compilation);
    assert!(status.error);
    assert_eq!(
        status.details,
        "Failed to compile the heuristic 'user1/Edge Detector/2'\nmissing ';'"
    );

    let alert = setup.store.all::<Alert>().pop().unwrap();
    assert_eq!(alert.message, "Failed to compile the heuristic 'user1/Edge Detector/2'");
    assert!(setup.config.upload_repository.join("user1/upload_42.cpp").exists());
    assert_eq!(setup.store.all::<JobRecord>()[0].status, JobStatus::Failed);
}

#[tokio::test]
async fn crash_during_the_test_is_mailed_with_its_report() {
    let setup = setup(vec![
        Message::new("COMPILATION_OK"),
        Message::new("ANALYZE_OK"),
        Message::new("HEURISTIC_CRASH"),
        Message::new("CONTEXT").arg("frame 12"),
        Message::new("STACKTRACE").arg("#0 Detector::compute"),
    ]);

    run_checker(&setup).await;

    let report = setup.store.all::<PluginErrorReport>().pop().unwrap();
    assert_eq!(report.heuristic_version, Some(setup.heuristic.id));
    assert_eq!(report.error_type, PluginErrorType::Crash);
    assert_eq!(report.context.as_deref(), Some("frame 12"));
    assert_eq!(report.stacktrace.as_deref(), Some("#0 Detector::compute"));

    let status = setup.store.all::<HeuristicTestStatus>().pop().unwrap();
    assert_eq!(status.phase, TestPhase::Test);

    // The crash mail replaces the alert mail
    let sent = setup.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "Your heuristic 'user1/Edge Detector/2' crashed");
    assert!(sent[0].1.contains("STACKTRACE\n----------\n\n#0 Detector::compute"));

    let hv = setup.store.get::<HeuristicVersion>(setup.heuristic.id).unwrap();
    assert_eq!(hv.status, HeuristicStatus::Disabled);
}

#[tokio::test]
async fn unchecked_versions_are_queued_on_startup() {
    let setup = setup(Vec::new());
    setup
        .store
        .insert(HeuristicVersion {
            author: "User1".into(),
            name: "Done".into(),
            checked: true,
            ..Default::default()
        })
        .unwrap();
    setup
        .store
        .delete_where::<Server>(|_| true)
        .unwrap();

    let services = Services::new(
        setup.store.clone(),
        setup.config.clone(),
        setup.mailer.clone(),
    );
    let mut engine = TaskEngine::new(HeuristicChecker, services);
    engine.start().await;

    let jobs = setup.store.all::<JobRecord>();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Delayed);
    assert_eq!(engine.timeout(), Some(60));
}
