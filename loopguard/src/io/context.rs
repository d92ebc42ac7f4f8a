//! Resume note written to `.loopguard/context/resume.md` before truncation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use super::guidance::{Guidance, GuidanceEngine};

/// Values rendered into the resume note.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResumeNote {
    pub written_at: String,
    pub session_id: Option<String>,
    pub session_status: Option<String>,
    pub task_id: Option<String>,
    pub task_title: Option<String>,
    pub task_status: Option<String>,
    pub attempt_state: Option<String>,
    pub tier: String,
    pub tier_name: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub breaker_state: String,
    pub breaker_failures: u32,
    pub breaker_threshold: u32,
    pub autonomous: bool,
    pub checkpoint_id: Option<String>,
    pub allowed: Vec<String>,
}

/// Render and atomically replace the resume note.
pub fn write_resume_note(path: &Path, engine: &GuidanceEngine, note: &ResumeNote) -> Result<()> {
    let rendered = engine.render(Guidance::ResumeNote, note);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create context dir {}", parent.display()))?;
    }
    super::write_atomic(path, &rendered)?;
    debug!(
        path = %path.display(),
        session_id = ?note.session_id,
        checkpoint_id = ?note.checkpoint_id,
        "resume note written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_carries_identifiers_breaker_and_flag() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("context").join("resume.md");
        let engine = GuidanceEngine::new().expect("engine");
        let note = ResumeNote {
            written_at: "2026-01-01T00:00:00.000Z".to_string(),
            session_id: Some("ses-1".to_string()),
            session_status: Some("running".to_string()),
            task_id: Some("t1".to_string()),
            tier: "tier2".to_string(),
            tier_name: "balanced".to_string(),
            iteration: 4,
            max_iterations: 20,
            breaker_state: "closed".to_string(),
            breaker_failures: 1,
            breaker_threshold: 5,
            autonomous: true,
            checkpoint_id: Some("cp-1".to_string()),
            allowed: vec!["src/**".to_string()],
            ..ResumeNote::default()
        };

        write_resume_note(&path, &engine, &note).expect("write");
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("Session: ses-1 (running)"));
        assert!(text.contains("Task: t1"));
        assert!(text.contains("Breaker: closed (1/5"));
        assert!(text.contains("Autonomous mode: on"));
        assert!(text.contains("Checkpoint: cp-1"));
        assert!(text.contains("- `src/**`"));
    }

    #[test]
    fn missing_session_renders_placeholders() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("resume.md");
        let engine = GuidanceEngine::new().expect("engine");
        write_resume_note(&path, &engine, &ResumeNote::default()).expect("write");
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("Session: none"));
        assert!(text.contains("Autonomous mode: off"));
    }
}
