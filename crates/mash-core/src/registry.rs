//! Static table of the tasks run by the scheduler.

use tracing::{debug, instrument};

use crate::{
    ScheduledTask, Services, Task, TaskEngine,
    tasks::{
        ExperimentLauncher, ExperimentScheduler, HeuristicChecker, HeuristicDebugger,
        HeuristicRanker, HeuristicsClusterer, ServerIdentificator, ServersChecker,
    },
};

/// A task the scheduler knows how to build.
pub struct TaskEntry {
    pub name: &'static str,
    build: fn(Services) -> Box<dyn ScheduledTask>,
}

impl TaskEntry {
    const fn of<T: Task + Default>() -> Self {
        Self {
            name: T::NAME,
            build: build::<T>,
        }
    }

    #[inline]
    pub fn build(&self, services: Services) -> Box<dyn ScheduledTask> {
        (self.build)(services)
    }
}

fn build<T: Task + Default>(services: Services) -> Box<dyn ScheduledTask> {
    Box::new(TaskEngine::new(T::default(), services))
}

/// Messages are offered to the tasks in this order.
pub static TASKS: &[TaskEntry] = &[
    TaskEntry::of::<ServersChecker>(),
    TaskEntry::of::<ServerIdentificator>(),
    TaskEntry::of::<ExperimentLauncher>(),
    TaskEntry::of::<ExperimentScheduler>(),
    TaskEntry::of::<HeuristicChecker>(),
    TaskEntry::of::<HeuristicRanker>(),
    TaskEntry::of::<HeuristicsClusterer>(),
    TaskEntry::of::<HeuristicDebugger>(),
];

/// Build one engine per registered task.
#[instrument(level = "debug", skip(services))]
pub fn build_all(services: &Services) -> Vec<Box<dyn ScheduledTask>> {
    TASKS
        .iter()
        .map(|entry| {
            let task = entry.build(services.clone());
            debug!(task = entry.name, commands = task.commands().len(), "task built");
            task
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mash_model::Store;

    use super::*;
    use crate::{MemoryMailer, SchedulerConfig};

    #[tokio::test]
    async fn every_task_is_built_with_its_commands() {
        let services = Services::new(
            Store::new(),
            SchedulerConfig::default(),
            Arc::new(MemoryMailer::new()),
        );
        let tasks = build_all(&services);
        let names: Vec<_> = tasks.iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            [
                "ServersChecker",
                "ServerIdentificator",
                "ExperimentLauncher",
                "ExperimentScheduler",
                "HeuristicChecker",
                "HeuristicRanker",
                "HeuristicsClusterer",
                "HeuristicDebugger",
            ]
        );

        let commands: Vec<_> = tasks
            .iter()
            .flat_map(|t| t.commands().iter().map(|c| c.name))
            .collect();
        assert!(commands.contains(&"CHECK_SERVERS_STATUS"));
        assert!(commands.contains(&"IDENTIFY_SERVER"));
        assert!(commands.contains(&"RUN_EXPERIMENT"));
        assert!(commands.contains(&"CANCEL_EXPERIMENT"));
        assert!(commands.contains(&"SCHEDULE_PUBLIC_EXPERIMENTS"));
        assert!(commands.contains(&"CHECK_HEURISTIC"));
        assert!(commands.contains(&"RANK_CONTEST_ENTRIES"));
        assert!(commands.contains(&"CLUSTER_HEURISTICS"));
        assert!(commands.contains(&"DEBUG_HEURISTIC"));
    }

    #[tokio::test]
    async fn every_emitted_event_has_a_consumer() {
        let services = Services::new(
            Store::new(),
            SchedulerConfig::default(),
            Arc::new(MemoryMailer::new()),
        );
        let tasks = build_all(&services);
        let events: Vec<_> = tasks
            .iter()
            .flat_map(|t| t.events().iter().map(|c| c.name))
            .collect();
        for event in [
            "EVT_PUBLIC_EXPERIMENT_DONE",
            "EVT_PUBLIC_EXPERIMENT_FAILED",
            "EVT_EXPERIMENT_CANCELLED",
            "EVT_HEURISTIC_CHECKED",
            "EVT_HEURISTIC_EVALUATED",
            "EVT_HEURISTIC_SIGNATURE_RECORDED",
        ] {
            assert!(events.contains(&event), "{event} has no consumer");
        }
    }
}
