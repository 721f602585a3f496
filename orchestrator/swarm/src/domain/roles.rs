// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use regex::Regex;
use std::sync::OnceLock;

use autocoder_core::domain::agent::AgentRole;
use autocoder_core::domain::task::Task;

fn testing_keyword() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\b(test\w*|coverage)\b").expect("Invalid tester keyword regex"))
}

/// Whether a task needs a dedicated tester: its requirements mention
/// testing or coverage, or its context names test suites.
pub fn requires_tester(task: &Task) -> bool {
    !task.context.constraints.test_suites.is_empty()
        || task.requirements.iter().any(|r| testing_keyword().is_match(r))
}

/// Worker roles for a task, in spawn order: coder, tester (if needed), reviewer.
pub fn derive_roles(task: &Task) -> Vec<AgentRole> {
    let mut roles = vec![AgentRole::Coder];
    if requires_tester(task) {
        roles.push(AgentRole::Tester);
    }
    roles.push(AgentRole::Reviewer);
    roles
}

#[cfg(test)]
mod tests {
    use super::*;
    use autocoder_core::domain::task::{NewTask, TaskConstraints, TaskContext};

    fn task(requirements: &[&str]) -> Task {
        Task::new(NewTask {
            title: "t".to_string(),
            description: "d".to_string(),
            requirements: requirements.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn test_coder_and_reviewer_by_default() {
        assert_eq!(
            derive_roles(&task(&["implement login endpoint"])),
            vec![AgentRole::Coder, AgentRole::Reviewer]
        );
    }

    #[test]
    fn test_tester_from_keywords() {
        assert_eq!(
            derive_roles(&task(&["implement login endpoint", "with full test coverage"])),
            vec![AgentRole::Coder, AgentRole::Tester, AgentRole::Reviewer]
        );
        assert!(requires_tester(&task(&["Add Tests for parser"])));
        assert!(requires_tester(&task(&["improve Coverage"])));
        assert!(!requires_tester(&task(&["update contest page"])));
    }

    #[test]
    fn test_tester_from_declared_suites() {
        let mut t = task(&["refactor module"]);
        t.context = TaskContext {
            constraints: TaskConstraints {
                test_suites: vec!["unit".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(requires_tester(&t));
    }
}
