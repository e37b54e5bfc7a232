//! Tasks run by the scheduler.

mod farm;

pub mod experiment_launcher;
pub use experiment_launcher::ExperimentLauncher;

mod experiment_scheduler;
pub use experiment_scheduler::ExperimentScheduler;

mod heuristic_checker;
pub use heuristic_checker::HeuristicChecker;

mod heuristic_debugger;
pub use heuristic_debugger::HeuristicDebugger;

mod heuristic_ranker;
pub use heuristic_ranker::HeuristicRanker;

mod heuristics_clusterer;
pub use heuristics_clusterer::HeuristicsClusterer;

mod server_identificator;
pub use server_identificator::ServerIdentificator;

mod servers_checker;
pub use servers_checker::ServersChecker;
