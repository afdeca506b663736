//! Validation runner: judges a command and its output against lesson rules.
//!
//! Resolution order for a request with activity `a` and chapter `c`:
//!
//! 1. validator registered for `(a, c)`, then `a/chapters/c/validate.json`
//! 2. validator registered for `a`, then `a/validate.json`
//! 3. the same two files inside the packaged archive for `a`
//!
//! The first tier that has a validator decides. No validator anywhere
//! means no opinion. A validator that cannot be loaded or panics produces
//! a failing result carrying the error as its hint.

pub mod archive;
pub mod rules;

pub use archive::{DirectoryArchive, LessonArchive, PackagedArchive};
pub use rules::RuleSet;

use crate::error::Result;
use parking_lot::RwLock;
use sandboxd_protocol::ValidationResult;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// File name of declarative validators.
pub const VALIDATOR_FILE: &str = "validate.json";

/// What a validator judges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRequest {
    /// Activity identifier.
    pub activity: String,
    /// Chapter within the activity.
    #[serde(default)]
    pub chapter: Option<String>,
    /// Command as typed.
    pub command: String,
    /// Output attributed to the command.
    #[serde(default)]
    pub output: String,
    /// Current step, if known.
    #[serde(default)]
    pub step: Option<u32>,
    /// Flag submitted alongside the command.
    #[serde(default)]
    pub flag: Option<String>,
}

/// Judges a request. `Ok(None)` means no opinion.
pub trait Validator: Send + Sync {
    /// Run the validator.
    fn validate(&self, request: &ValidationRequest) -> Result<Option<ValidationResult>>;
}

impl<F> Validator for F
where
    F: Fn(&ValidationRequest) -> Result<Option<ValidationResult>> + Send + Sync,
{
    fn validate(&self, request: &ValidationRequest) -> Result<Option<ValidationResult>> {
        self(request)
    }
}

type ScopeKey = (String, Option<String>);

struct RunnerInner {
    registered: RwLock<HashMap<ScopeKey, Arc<dyn Validator>>>,
    lessons: Option<Arc<dyn LessonArchive>>,
    packaged: Option<Arc<dyn LessonArchive>>,
}

/// Resolves and runs validators.
#[derive(Clone)]
pub struct ValidationRunner {
    inner: Arc<RunnerInner>,
}

impl std::fmt::Debug for ValidationRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationRunner")
            .field("registered", &self.inner.registered.read().len())
            .field("lessons", &self.inner.lessons.as_ref().map(|a| a.describe()))
            .field("packaged", &self.inner.packaged.as_ref().map(|a| a.describe()))
            .finish()
    }
}

impl Default for ValidationRunner {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl ValidationRunner {
    /// Runner reading lesson files from `lessons` and `packaged`.
    pub fn new(
        lessons: Option<Arc<dyn LessonArchive>>,
        packaged: Option<Arc<dyn LessonArchive>>,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                registered: RwLock::new(HashMap::new()),
                lessons,
                packaged,
            }),
        }
    }

    /// Register a validator for an activity, or for one chapter of it.
    pub fn register(&self, activity: &str, chapter: Option<&str>, validator: Arc<dyn Validator>) {
        self.inner
            .registered
            .write()
            .insert((activity.to_string(), chapter.map(str::to_string)), validator);
    }

    /// Judge a request on the blocking pool.
    pub async fn validate(&self, request: ValidationRequest) -> Option<ValidationResult> {
        let runner = self.clone();
        let activity = request.activity.clone();
        let joined = tokio::task::spawn_blocking(move || runner.validate_blocking(&request)).await;

        match joined {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(activity = %activity, error = %e, "validator fault");
                Some(ValidationResult::failed(format!("Validation error: {}", e)))
            }
            Err(e) => {
                tracing::error!(activity = %activity, error = %e, "validator panicked");
                Some(ValidationResult::failed(format!(
                    "Validation error: validator for {} panicked",
                    activity
                )))
            }
        }
    }

    /// Judge a request on the current thread.
    pub fn validate_blocking(&self, request: &ValidationRequest) -> Result<Option<ValidationResult>> {
        let activity = request.activity.trim();
        if activity.is_empty() {
            return Ok(None);
        }
        let chapter = request
            .chapter
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        let mut scopes = Vec::with_capacity(2);
        if let Some(chapter) = chapter {
            scopes.push(Some(chapter));
        }
        scopes.push(None);

        for scope in &scopes {
            let registered = self
                .inner
                .registered
                .read()
                .get(&(activity.to_string(), scope.map(str::to_string)))
                .cloned();
            if let Some(validator) = registered {
                return validator.validate(request);
            }
            if let Some(lessons) = &self.inner.lessons {
                if let Some(rules) = load_rules(lessons.as_ref(), activity, *scope)? {
                    return rules.validate(request);
                }
            }
        }

        if let Some(packaged) = &self.inner.packaged {
            for scope in &scopes {
                if let Some(rules) = load_rules(packaged.as_ref(), activity, *scope)? {
                    return rules.validate(request);
                }
            }
        }

        Ok(None)
    }
}

fn load_rules(
    archive: &dyn LessonArchive,
    activity: &str,
    chapter: Option<&str>,
) -> Result<Option<RuleSet>> {
    let Some(bytes) = archive.read(activity, chapter, VALIDATOR_FILE)? else {
        return Ok(None);
    };
    let source = match chapter {
        Some(chapter) => format!(
            "{}:{}/chapters/{}/{}",
            archive.describe(),
            activity,
            chapter,
            VALIDATOR_FILE
        ),
        None => format!("{}:{}/{}", archive.describe(), activity, VALIDATOR_FILE),
    };
    RuleSet::parse(&source, &bytes).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::path::Path;

    fn request(activity: &str, chapter: Option<&str>, command: &str) -> ValidationRequest {
        ValidationRequest {
            activity: activity.to_string(),
            chapter: chapter.map(str::to_string),
            command: command.to_string(),
            output: String::new(),
            step: Some(1),
            flag: None,
        }
    }

    fn write_rules(dir: &Path, hint: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let rules = format!(
            r#"{{"steps": [{{"step": 1, "command": "^never$", "hint": "{}"}}]}}"#,
            hint
        );
        std::fs::write(dir.join(VALIDATOR_FILE), rules).unwrap();
    }

    fn fixed(result: ValidationResult) -> Arc<dyn Validator> {
        Arc::new(move |_: &ValidationRequest| -> Result<Option<ValidationResult>> {
            Ok(Some(result.clone()))
        })
    }

    #[tokio::test]
    async fn test_no_validator_means_no_opinion() {
        let runner = ValidationRunner::default();
        assert!(runner.validate(request("mira", None, "ls")).await.is_none());
        assert!(runner.validate(request("", None, "ls")).await.is_none());
    }

    #[tokio::test]
    async fn test_chapter_validator_takes_precedence() {
        let runner = ValidationRunner::default();
        let chapter_result = ValidationResult {
            pass: true,
            hint: Some("chapter".to_string()),
            menu: Some(vec!["a".to_string(), "b".to_string()]),
            achievements: Some(["first-blood".to_string()].into_iter().collect()),
            flag_required: true,
        };
        runner.register("mira", Some("intro"), fixed(chapter_result.clone()));
        runner.register("mira", None, fixed(ValidationResult::failed("activity")));

        let got = runner.validate(request("mira", Some("intro"), "ls")).await;
        assert_eq!(got, Some(chapter_result));

        let got = runner.validate(request("mira", Some("other"), "ls")).await;
        assert_eq!(got.unwrap().hint.as_deref(), Some("activity"));
    }

    #[tokio::test]
    async fn test_lesson_files_resolve_by_scope() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(&dir.path().join("mira"), "from activity");
        write_rules(&dir.path().join("mira/chapters/two"), "from chapter");

        let runner = ValidationRunner::new(Some(Arc::new(DirectoryArchive::new(dir.path()))), None);

        let got = runner.validate(request("mira", Some("two"), "ls")).await.unwrap();
        assert_eq!(got.hint.as_deref(), Some("from chapter"));

        let got = runner.validate(request("mira", Some("one"), "ls")).await.unwrap();
        assert_eq!(got.hint.as_deref(), Some("from activity"));
    }

    #[tokio::test]
    async fn test_registered_validator_beats_lesson_file() {
        let dir = tempfile::tempdir().unwrap();
        write_rules(&dir.path().join("mira"), "from file");
        let runner = ValidationRunner::new(Some(Arc::new(DirectoryArchive::new(dir.path()))), None);
        runner.register("mira", None, fixed(ValidationResult::passed()));

        let got = runner.validate(request("mira", None, "ls")).await.unwrap();
        assert!(got.pass);
    }

    #[tokio::test]
    async fn test_packaged_archive_is_last_resort() {
        let lessons = tempfile::tempdir().unwrap();
        let packages = tempfile::tempdir().unwrap();
        archive::tests::write_package(
            packages.path(),
            "rpg",
            &[(
                "rpg/validate.json",
                r#"{"steps": [{"step": 1, "command": "^look$"}]}"#,
            )],
        );

        let runner = ValidationRunner::new(
            Some(Arc::new(DirectoryArchive::new(lessons.path()))),
            Some(Arc::new(PackagedArchive::new(packages.path()))),
        );
        let got = runner.validate(request("rpg", Some("one"), "look")).await.unwrap();
        assert!(got.pass);
    }

    #[tokio::test]
    async fn test_faults_become_failing_results() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join(VALIDATOR_FILE), "{ nope").unwrap();
        let runner = ValidationRunner::new(Some(Arc::new(DirectoryArchive::new(dir.path()))), None);

        let got = runner.validate(request("broken", None, "ls")).await.unwrap();
        assert!(!got.pass);
        assert!(got.hint.unwrap().starts_with("Validation error: "));

        runner.register(
            "erroring",
            None,
            Arc::new(|_: &ValidationRequest| -> Result<Option<ValidationResult>> {
                Err(Error::validator("custom", "boom"))
            }),
        );
        let got = runner.validate(request("erroring", None, "ls")).await.unwrap();
        assert_eq!(
            got.hint.as_deref(),
            Some("Validation error: validator failed: custom: boom")
        );
    }

    #[tokio::test]
    async fn test_panicking_validator_is_contained() {
        let runner = ValidationRunner::default();
        runner.register(
            "panics",
            None,
            Arc::new(|_: &ValidationRequest| -> Result<Option<ValidationResult>> {
                panic!("validator bug")
            }),
        );
        let got = runner.validate(request("panics", None, "ls")).await.unwrap();
        assert!(!got.pass);
        assert!(got.hint.unwrap().contains("panicked"));
    }
}
