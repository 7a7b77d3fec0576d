//! Story catalog compilation
//!
//! Turns story descriptors into the test tree of one browser:
//!
//! ```text
//! root
//!  └── kind suite ("Button")
//!       ├── test "Primary"            path [browser, Primary, Button]
//!       └── story suite ("Opened")    story with named tests
//!            ├── test "hover"         path [browser, hover, Opened, Button]
//!            └── test "click"
//! ```
//!
//! Suites live in an arena addressed by [`SuiteId`]; tests are also kept in
//! a flat id map. Compilation is deterministic: the same stories always give
//! the same ids, tree shape and order.

use creevey_common::story::{RawStoryError, StoryEntry};
use creevey_common::{should_skip, Config, Skip, SkipContext, StoryDescriptor, Test, TestsById};
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::RunnerError;
use crate::session::StoryRef;
use crate::steps::{parse_story_tests, StoryStep};

pub type SuiteId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuiteChild {
    Suite(SuiteId),
    Test { title: String, id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteNode {
    pub title: String,
    pub children: Vec<SuiteChild>,
}

/// Arena of suites; index 0 is the untitled root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteTree {
    nodes: Vec<SuiteNode>,
}

impl Default for SuiteTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SuiteTree {
    pub const ROOT: SuiteId = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![SuiteNode {
                title: String::new(),
                children: Vec::new(),
            }],
        }
    }

    pub fn node(&self, id: SuiteId) -> &SuiteNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Child suite of `parent` with exactly this title, created at the end if missing
    pub fn find_or_create(&mut self, parent: SuiteId, title: &str) -> SuiteId {
        let existing = self.nodes[parent].children.iter().find_map(|child| match child {
            SuiteChild::Suite(id) if self.nodes[*id].title == title => Some(*id),
            _ => None,
        });
        if let Some(id) = existing {
            return id;
        }

        let id = self.nodes.len();
        self.nodes.push(SuiteNode {
            title: title.to_string(),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(SuiteChild::Suite(id));
        id
    }

    pub fn add_test(&mut self, parent: SuiteId, title: &str, id: &str) {
        self.nodes[parent].children.push(SuiteChild::Test {
            title: title.to_string(),
            id: id.to_string(),
        });
    }

    /// Test ids in depth-first order
    pub fn test_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        self.collect(Self::ROOT, &mut ids);
        ids
    }

    fn collect<'a>(&'a self, suite: SuiteId, ids: &mut Vec<&'a str>) {
        for child in &self.nodes[suite].children {
            match child {
                SuiteChild::Suite(id) => self.collect(*id, ids),
                SuiteChild::Test { id, .. } => ids.push(id),
            }
        }
    }
}

/// Everything a worker needs to run one test
#[derive(Debug, Clone)]
pub struct CompiledTest {
    pub test: Test,
    pub story: StoryRef,
    pub capture_element: Option<String>,
    /// Steps of a named story test; `None` means a plain screenshot
    pub steps: Option<Vec<StoryStep>>,
}

/// Compiled tests of one browser
#[derive(Debug, Default)]
pub struct Catalog {
    pub browser: String,
    pub tests: BTreeMap<String, CompiledTest>,
    pub tree: SuiteTree,
    pub errors: Vec<RunnerError>,
}

impl Catalog {
    pub fn tests_by_id(&self) -> TestsById {
        self.tests
            .iter()
            .map(|(id, compiled)| (id.clone(), compiled.test.clone()))
            .collect()
    }
}

/// Compile the test tree of one browser
pub fn compile(browser: &str, stories: &[StoryEntry]) -> Catalog {
    let mut catalog = Catalog {
        browser: browser.to_string(),
        ..Default::default()
    };

    for entry in stories {
        let story = match entry {
            Ok(story) => story,
            Err(RawStoryError { id, reason }) => {
                catalog.errors.push(RunnerError::Compilation {
                    story: id.clone().unwrap_or_else(|| "<unknown>".to_string()),
                    reason: reason.clone(),
                });
                continue;
            }
        };
        if let Err(e) = add_story(&mut catalog, story) {
            catalog.errors.push(e);
        }
    }

    for error in &catalog.errors {
        warn!("{} ({})", error, browser);
    }
    catalog
}

fn add_story(catalog: &mut Catalog, story: &StoryDescriptor) -> Result<(), RunnerError> {
    let params = story.creevey();
    let skip_rule = params.and_then(|p| p.skip.as_ref());
    let skip_for = |test: Option<&str>| -> Skip {
        match skip_rule {
            Some(options) => should_skip(
                &SkipContext {
                    browser: &catalog.browser,
                    kind: &story.kind,
                    story: &story.name,
                    test,
                },
                options,
            ),
            None => Skip::Flag(false),
        }
    };

    let story_ref = StoryRef {
        id: story.id.clone(),
        kind: story.kind.clone(),
        name: story.name.clone(),
    };
    let capture_element = story.capture_element().map(String::from);

    let Some(raw_tests) = params.and_then(|p| p.tests.as_ref()) else {
        let path = vec![
            catalog.browser.clone(),
            story.name.clone(),
            story.kind.clone(),
        ];
        let test = Test::new(path, skip_for(None));
        let kind_suite = catalog.tree.find_or_create(SuiteTree::ROOT, &story.kind);
        catalog.tree.add_test(kind_suite, &story.name, &test.id);
        insert(catalog, CompiledTest {
            test,
            story: story_ref,
            capture_element,
            steps: None,
        });
        return Ok(());
    };

    // validate everything before touching the tree so a bad story leaves no trace
    let named = parse_story_tests(raw_tests)
        .and_then(|named| {
            for test in &named {
                test.check_default_image(&catalog.browser)?;
            }
            Ok(named)
        })
        .map_err(|reason| RunnerError::Compilation {
            story: story.id.clone(),
            reason,
        })?;
    let compiled: Vec<CompiledTest> = named
        .into_iter()
        .map(|named| {
            let path = vec![
                catalog.browser.clone(),
                named.name.clone(),
                story.name.clone(),
                story.kind.clone(),
            ];
            CompiledTest {
                test: Test::new(path, skip_for(Some(&named.name))),
                story: story_ref.clone(),
                capture_element: capture_element.clone(),
                steps: Some(named.steps),
            }
        })
        .collect();

    let kind_suite = catalog.tree.find_or_create(SuiteTree::ROOT, &story.kind);
    let story_suite = catalog.tree.find_or_create(kind_suite, &story.name);
    for test in compiled {
        let title = test.test.path[1].clone();
        catalog.tree.add_test(story_suite, &title, &test.test.id);
        insert(catalog, test);
    }
    Ok(())
}

fn insert(catalog: &mut Catalog, compiled: CompiledTest) {
    let id = compiled.test.id.clone();
    if catalog.tests.insert(id.clone(), compiled).is_some() {
        warn!("Duplicate test id {} in {}; keeping the later story", id, catalog.browser);
    }
}

/// Compile every enabled browser and merge the flat maps
pub fn compile_all(config: &Config, stories: &[StoryEntry]) -> (TestsById, Vec<RunnerError>) {
    let mut tests = TestsById::new();
    let mut errors = Vec::new();
    for browser in config.browsers() {
        let catalog = compile(&browser.name, stories);
        tests.extend(catalog.tests_by_id());
        errors.extend(catalog.errors);
    }
    (tests, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use creevey_common::story::parse_stories;

    const STORIES: &str = r##"[
        {"id": "button--primary", "kind": "Button", "name": "Primary"},
        {"id": "button--disabled", "kind": "Button", "name": "Disabled",
         "parameters": {"creevey": {"skip": {"in": "ie", "reason": "flaky"}}}},
        {"id": "select--opened", "kind": "Select", "name": "Opened",
         "parameters": {"creevey": {"captureElement": "#root > *", "tests": {
            "idle": [{"action": "screenshot"}],
            "hover": [{"action": "hover", "selector": "button"}, {"action": "screenshot"}]
         }}}},
        {"id": "broken--steps", "kind": "Broken", "name": "Steps",
         "parameters": {"creevey": {"tests": {"bad": [{"action": "fly"}]}}}}
    ]"##;

    #[test]
    fn test_compile_builds_paths_and_suites() {
        let stories = parse_stories(STORIES).unwrap();
        let catalog = compile("chrome", &stories);

        assert_eq!(catalog.tests.len(), 4);
        assert_eq!(catalog.errors.len(), 1);
        assert!(matches!(
            &catalog.errors[0],
            RunnerError::Compilation { story, .. } if story == "broken--steps"
        ));

        let paths: Vec<Vec<String>> = catalog
            .tree
            .test_ids()
            .iter()
            .map(|id| catalog.tests[*id].test.path.clone())
            .collect();
        assert_eq!(paths[0], vec!["chrome", "Primary", "Button"]);
        assert_eq!(paths[1], vec!["chrome", "Disabled", "Button"]);
        assert_eq!(paths[2], vec!["chrome", "idle", "Opened", "Select"]);
        assert_eq!(paths[3], vec!["chrome", "hover", "Opened", "Select"]);

        // the broken story must not leave an empty suite behind
        let root = catalog.tree.node(SuiteTree::ROOT);
        assert_eq!(root.children.len(), 2);
    }

    #[test]
    fn test_compile_applies_skip_rules_per_browser() {
        let stories = parse_stories(STORIES).unwrap();
        let chrome = compile("chrome", &stories);
        let ie = compile("ie", &stories);

        let skipped = |catalog: &Catalog| {
            catalog
                .tests
                .values()
                .filter(|t| t.test.skip.is_skipped())
                .map(|t| t.test.skip.clone())
                .collect::<Vec<_>>()
        };
        assert!(skipped(&chrome).is_empty());
        assert_eq!(skipped(&ie), vec![Skip::Reason("flaky".into())]);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let stories = parse_stories(STORIES).unwrap();
        let first = compile("chrome", &stories);
        let second = compile("chrome", &stories);
        assert_eq!(first.tree, second.tree);
        assert_eq!(first.tests_by_id(), second.tests_by_id());
    }

    #[test]
    fn test_suites_are_reused_by_title() {
        let mut tree = SuiteTree::new();
        let a = tree.find_or_create(SuiteTree::ROOT, "Button");
        let b = tree.find_or_create(SuiteTree::ROOT, "Input");
        assert_eq!(tree.find_or_create(SuiteTree::ROOT, "Button"), a);
        assert_ne!(a, b);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_compile_all_merges_browsers() {
        let stories = parse_stories(STORIES).unwrap();
        let config: Config = toml::from_str("[browsers]\nchrome = true\nff = \"firefox\"\n").unwrap();
        let (tests, errors) = compile_all(&config, &stories);
        assert_eq!(tests.len(), 8);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_named_screenshot_may_not_shadow_the_unnamed_one() {
        let stories = parse_stories(
            r#"[{"id": "card--clash", "kind": "Card", "name": "Clash",
                "parameters": {"creevey": {"tests": {"both": [
                    {"action": "screenshot"},
                    {"action": "screenshot", "name": "chrome"}
                ]}}}}]"#,
        )
        .unwrap();

        let chrome = compile("chrome", &stories);
        assert!(chrome.tests.is_empty());
        assert!(matches!(
            &chrome.errors[0],
            RunnerError::Compilation { story, reason }
                if story == "card--clash" && reason.contains("'chrome'")
        ));
        assert_eq!(chrome.tree.node(SuiteTree::ROOT).children.len(), 0);

        // the same steps are fine where the default image has another name
        let ff = compile("ff", &stories);
        assert!(ff.errors.is_empty());
        assert_eq!(ff.tests.len(), 1);
    }
}
