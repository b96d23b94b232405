//! Journey-step and error recording from inside the subprocess.
//!
//! The setupper cannot talk to the orchestrator directly; it leaves
//! its progress under `response/steps/` and its failure report under
//! `response/error/` in the work directory. Every write here is
//! best-effort: losing a diagnostic must never abort the spawn.

use crate::error::ErrorCategory;
use crate::journey::{JourneyStep, JourneyStepState};
use crate::timing::monotonic_usec_coarse;
use crate::workdir::WorkDirView;

pub fn record_step_in_progress(work_dir: &WorkDirView, step: JourneyStep) {
    let dir = work_dir.step_dir(step);
    work_dir.write_best_effort(&dir.join("state"), JourneyStepState::InProgress.name());
}

/// Records a step's terminal state along with its duration in whole
/// seconds, measured from `start_usec`.
pub fn record_step_complete(
    work_dir: &WorkDirView,
    step: JourneyStep,
    state: JourneyStepState,
    start_usec: u64,
) {
    let now = monotonic_usec_coarse();
    let dir = work_dir.step_dir(step);
    work_dir.write_best_effort(&dir.join("state"), state.name());
    let seconds = now.saturating_sub(start_usec) / 1_000_000;
    work_dir.write_best_effort(&dir.join("duration"), seconds.to_string());
}

pub fn record_error_category(work_dir: &WorkDirView, category: ErrorCategory) {
    work_dir.write_best_effort(&work_dir.error_path("category"), category.name());
}

pub fn record_advanced_problem_details(work_dir: &WorkDirView, message: &str) {
    work_dir.write_best_effort(
        &work_dir.error_path("advanced_problem_details"),
        message,
    );
}

pub fn record_error_summary(
    work_dir: &WorkDirView,
    message: &str,
    is_also_advanced_problem_details: bool,
) {
    work_dir.write_best_effort(&work_dir.error_path("summary"), message);
    if is_also_advanced_problem_details {
        record_advanced_problem_details(work_dir, message);
    }
}

pub fn record_and_print_error_summary(
    work_dir: &WorkDirView,
    message: &str,
    is_also_advanced_problem_details: bool,
) {
    eprintln!("Error: {message}");
    record_error_summary(work_dir, message, is_also_advanced_problem_details);
}

pub fn record_problem_description_html(work_dir: &WorkDirView, html: &str) {
    work_dir.write_best_effort(&work_dir.error_path("problem_description.html"), html);
}

pub fn record_solution_description_html(work_dir: &WorkDirView, html: &str) {
    work_dir.write_best_effort(&work_dir.error_path("solution_description.html"), html);
}
