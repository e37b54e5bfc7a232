use mash_model::{
    Alert, Configuration, ConfigurationType, Experiment, HeuristicStatus, HeuristicVersion,
    Instrument, InstrumentStatus, PluginErrorReport, PluginErrorType, TaskType,
};
use mash_net::Message;
use tracing::{error, warn};

use super::{ExperimentLauncher, LaunchJob, Op, load, now, send, wait_response};
use crate::{TaskContext, TaskError, utils::get_server_logs};

/// Text reported by a server, made safe to show in the web application.
fn encode(text: &str) -> String {
    text.replace('\t', "    ")
        .replace('\'', "\\'")
        .replace('"', "\\\"")
}

/// `author/name[/version]`, the version defaulting to 1.
fn parse_heuristic_name(name: &str) -> Option<(&str, &str, u32)> {
    let mut parts = name.split('/');
    let author = parts.next()?;
    let name = parts.next()?;
    let version = match parts.next() {
        Some(v) => v.parse().ok()?,
        None => 1,
    };
    Some((author, name, version))
}

/// What the server said about a plugin failure.
struct Diagnosis {
    report: Option<PluginErrorReport>,
    need_context: bool,
    need_stacktrace: bool,
    can_retry: bool,
}

impl Diagnosis {
    fn none() -> Self {
        Self {
            report: None,
            need_context: false,
            need_stacktrace: false,
            can_retry: false,
        }
    }
}

impl ExperimentLauncher {
    /// The error path of the protocol.
    ///
    /// The server is asked what went wrong (unless `report_errors` is
    /// false). A failing plugin is disabled and its author notified. The
    /// experiment is retried when a heuristic was disabled and others
    /// remain, otherwise the job fails.
    pub(super) async fn process_error(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
        message: &str,
        response: Option<&Message>,
        report_errors: bool,
    ) -> Result<(), TaskError> {
        let mut alert = Alert::new(message);
        if let Some(response) = response {
            alert.details = Some(if response.is("ERROR") {
                format!("Error: {}", response.text(0).unwrap_or_default())
            } else {
                format!(
                    "Unknown response from the Experiment Server. Expected: OK, got: {response}"
                )
            });
        }
        match &alert.details {
            Some(details) => job
                .log
                .write(&format!("ERROR - {}\n{details}\n", alert.message)),
            None => job.log.write(&format!("ERROR - {}\n", alert.message)),
        }

        let mut can_retry = false;
        if report_errors
            && job.record.experiment.is_some()
            && send(job, &Message::new("REPORT_ERRORS")).await
        {
            let (experiment, configuration) = load(cx, job)?;
            let response = wait_response(job).await;

            let diagnosis = match &response {
                Some(r) if r.is("ERROR") => {
                    alert.details = Some(encode(&r.text(0).unwrap_or_default()));
                    Diagnosis::none()
                }
                Some(r) if r.name.starts_with("HEURISTIC_") => {
                    self.heuristic_failure(cx, &experiment, &configuration, r)?
                }
                Some(r) if r.name.starts_with("PREDICTOR_") => {
                    self.predictor_failure(cx, &experiment, &configuration, r)
                }
                Some(r) if r.name.starts_with("INSTRUMENT_") => {
                    self.instrument_failure(cx, &experiment, &configuration, r)?
                }
                _ => Diagnosis::none(),
            };

            if let Some(mut report) = diagnosis.report {
                if diagnosis.need_context
                    && let Some(r) = wait_response(job).await
                    && r.is("CONTEXT")
                {
                    report.context = r.text(0).map(|c| encode(&c));
                }
                if diagnosis.need_stacktrace
                    && let Some(r) = wait_response(job).await
                    && r.is("STACKTRACE")
                {
                    report.stacktrace = r.text(0).map(|s| encode(&s));
                }
                let report = cx.store().insert(report)?;
                self.mail_error_report(cx, &report, &experiment, &configuration)
                    .await;
            }
            can_retry = diagnosis.can_retry;
        }

        if !can_retry {
            return self.fail_job(cx, job, alert).await;
        }

        job.ext.nb_evaluation_rounds_done += 1;
        if send(job, &Message::new("RESET")).await {
            job.log.write("Retrying the experiment...\n");
            job.operation = Some(Op::SendGlobalSeed);
            Ok(())
        } else {
            self.fail_job(cx, job, Alert::new("Failed to reset the Experiment Server"))
                .await
        }
    }

    fn heuristic_failure(
        &self,
        cx: &TaskContext,
        experiment: &Experiment,
        configuration: &Configuration,
        response: &Message,
    ) -> Result<Diagnosis, TaskError> {
        let store = cx.store();
        let heuristics: Vec<HeuristicVersion> = configuration
            .heuristics
            .iter()
            .filter_map(|id| store.get::<HeuristicVersion>(*id))
            .collect();

        let reference = response.text(0).unwrap_or_default();
        let culprit = parse_heuristic_name(&reference).and_then(|(author, name, version)| {
            heuristics
                .iter()
                .find(|hv| hv.matches(author, name, version))
                .cloned()
        });
        let Some(mut culprit) = culprit else {
            warn!(heuristic = %reference, "error reported for an unknown heuristic");
            return Ok(Diagnosis::none());
        };

        let mut report = PluginErrorReport {
            experiment: experiment.id,
            heuristic_version: Some(culprit.id),
            ..Default::default()
        };
        let mut need_stacktrace = false;
        match response.name.as_str() {
            "HEURISTIC_CRASH" => {
                report.error_type = PluginErrorType::Crash;
                need_stacktrace = true;
            }
            "HEURISTIC_TIMEOUT" => report.error_type = PluginErrorType::Timeout,
            _ => {
                report.error_type = PluginErrorType::Other;
                report.description = response.text(1);
            }
        }

        culprit.status = HeuristicStatus::Disabled;
        culprit.status_date = Some(now());
        store.save(&culprit)?;

        let remaining = heuristics
            .iter()
            .filter(|hv| hv.id != culprit.id && hv.status == HeuristicStatus::Ok)
            .count();
        let can_retry = remaining > 0
            && !matches!(
                configuration.experiment_type,
                ConfigurationType::Evaluation | ConfigurationType::ContestEntry
            );

        Ok(Diagnosis {
            report: Some(report),
            need_context: true,
            need_stacktrace,
            can_retry,
        })
    }

    fn predictor_failure(
        &self,
        cx: &TaskContext,
        experiment: &Experiment,
        configuration: &Configuration,
        response: &Message,
    ) -> Diagnosis {
        let predictor = cx
            .store()
            .try_get_setting(configuration.id, "USE_PREDICTOR")
            .unwrap_or_default();
        let mut report = PluginErrorReport {
            experiment: experiment.id,
            ..Default::default()
        };
        if configuration.task == TaskType::GoalPlanning {
            report.goalplanner = Some(predictor);
        } else {
            report.classifier = Some(predictor);
        }

        let mut need_stacktrace = false;
        match response.name.as_str() {
            "PREDICTOR_CRASH" => {
                report.error_type = PluginErrorType::Crash;
                need_stacktrace = true;
            }
            "PREDICTOR_TIMEOUT" => report.error_type = PluginErrorType::Timeout,
            _ => {
                report.error_type = PluginErrorType::Other;
                report.description = response.text(0).map(|d| encode(&d));
            }
        }

        Diagnosis {
            report: Some(report),
            need_context: true,
            need_stacktrace,
            can_retry: false,
        }
    }

    fn instrument_failure(
        &self,
        cx: &TaskContext,
        experiment: &Experiment,
        configuration: &Configuration,
        response: &Message,
    ) -> Result<Diagnosis, TaskError> {
        let store = cx.store();
        let reference = response.text(0).unwrap_or_default();
        let culprit = reference.split_once('/').and_then(|(author, name)| {
            configuration
                .instruments
                .iter()
                .filter_map(|id| store.get::<Instrument>(*id))
                .find(|i| i.author.eq_ignore_ascii_case(author) && i.name == name)
        });
        let Some(mut culprit) = culprit else {
            warn!(instrument = %reference, "error reported for an unknown instrument");
            return Ok(Diagnosis::none());
        };

        let mut report = PluginErrorReport {
            experiment: experiment.id,
            instrument: Some(culprit.id),
            ..Default::default()
        };
        let mut need_stacktrace = false;
        if response.is("INSTRUMENT_CRASH") {
            report.error_type = PluginErrorType::Crash;
            need_stacktrace = true;
        } else {
            report.error_type = PluginErrorType::Other;
            report.description = response.text(1);
        }

        culprit.status = InstrumentStatus::Disabled;
        store.save(&culprit)?;

        Ok(Diagnosis {
            report: Some(report),
            need_context: true,
            need_stacktrace,
            can_retry: false,
        })
    }

    /// Crashes and timeouts are mailed; other errors are only stored.
    async fn mail_error_report(
        &self,
        cx: &TaskContext,
        report: &PluginErrorReport,
        experiment: &Experiment,
        configuration: &Configuration,
    ) {
        let store = cx.store();
        let plugin = if let Some(hv) = report
            .heuristic_version
            .and_then(|id| store.get::<HeuristicVersion>(id))
        {
            ("heuristic", hv.fullname())
        } else if let Some(name) = report.classifier.clone() {
            ("classifier", name)
        } else if let Some(name) = report.goalplanner.clone() {
            ("goal-planner", name)
        } else if let Some(instrument) = report.instrument.and_then(|id| store.get::<Instrument>(id))
        {
            ("instrument", instrument.fullname())
        } else {
            return;
        };
        let (kind, name) = plugin;

        let subject = match report.error_type {
            PluginErrorType::Crash => format!("Your {kind} '{name}' crashed"),
            PluginErrorType::Timeout => format!("Your {kind} '{name}' took too much time"),
            PluginErrorType::Other => return,
        };

        let website = &cx.config().website_url;
        let mut body = match report.heuristic_version {
            Some(hv) => format!(
                "You can view this error report online on the page of the heuristic: {website}/heuristics/v{hv}/\n\n\nDue to this error, the heuristic will not be useable anymore!\n\nPlease fix the problem, and upload a new version of this heuristic.\n\n\n"
            ),
            None => format!(
                "Due to this error, this {kind} will not be useable anymore!\n\nPlease fix the problem, push a new version of this {kind} and notify the administrators about it.\n\n\n"
            ),
        };

        body.push_str("Experiment\n----------\n\n");
        match configuration.experiment_type {
            ConfigurationType::Evaluation => {
                body.push_str("This error happened during the evaluation of an heuristic\n\n\n");
            }
            _ => body.push_str(&format!(
                "This error happened during the experiment '{}' ({website}/experiments/{}/)\n\n\n",
                experiment.name, experiment.id
            )),
        }

        body.push_str("PROBLEM DESCRIPTION\n-------------------\n\n");
        let description = match (report.error_type, &report.description) {
            (_, Some(description)) => description.clone(),
            (PluginErrorType::Timeout, None) => format!("The {} took too much time", report.culprit()),
            _ => format!("The {} crashed", report.culprit()),
        };
        body.push_str(&description);
        body.push_str("\n\n\n");
        if let Some(context) = &report.context {
            body.push_str(&format!("CONTEXT\n-------\n\n{context}\n\n\n"));
        }
        if let Some(stacktrace) = &report.stacktrace {
            body.push_str(&format!("STACKTRACE\n----------\n\n{stacktrace}\n\n\n"));
        }

        cx.mail_admins(&subject, &body).await;
    }

    /// Collect the server logs, then mark the job and its experiment as
    /// failed.
    pub(super) async fn fail_job(
        &self,
        cx: &TaskContext,
        job: &mut LaunchJob,
        alert: Alert,
    ) -> Result<(), TaskError> {
        if let Some(client) = job.client.as_mut() {
            match get_server_logs(
                cx.store(),
                &cx.config().log_files_root,
                client,
                job.record.logs,
                None,
            )
            .await
            {
                Ok(logs) => {
                    job.record.logs = logs;
                    cx.store().save(&job.record)?;
                }
                Err(e) => error!(job = job.id(), error = %e, "cannot collect the server logs"),
            }
        }

        let experiment = job
            .record
            .experiment
            .and_then(|id| cx.store().get::<Experiment>(id));
        if let Some(mut experiment) = experiment.clone() {
            experiment.end = Some(now());
            cx.store().save(&experiment)?;
        }

        job.mark_as_failed(Some(alert)).await?;

        let public = experiment
            .as_ref()
            .and_then(|e| cx.store().get::<Configuration>(e.configuration))
            .is_some_and(|c| c.experiment_type == ConfigurationType::Public);
        if let Some(experiment) = experiment
            && public
        {
            cx.send_event(&Message::new("EVT_PUBLIC_EXPERIMENT_FAILED").arg(experiment.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_escapes_quotes_and_tabs() {
        assert_eq!(encode("a\tb 'c' \"d\""), "a    b \\'c\\' \\\"d\\\"");
    }

    #[test]
    fn heuristic_names_default_to_the_first_version() {
        assert_eq!(parse_heuristic_name("user1/h1"), Some(("user1", "h1", 1)));
        assert_eq!(parse_heuristic_name("user1/h1/4"), Some(("user1", "h1", 4)));
        assert_eq!(parse_heuristic_name("user1"), None);
        assert_eq!(parse_heuristic_name("user1/h1/x"), None);
    }
}
