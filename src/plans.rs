use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Error;
use crate::task::{NestedOptions, Task};


/// Declarative description of a task tree, as loaded from a plan file.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum PlanSpec {
    Command {
        name: String,
        args: Vec<String>,
    },
    TaskGroup {
        name: String,
        parallel: Vec<PlanSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parallelism: Option<usize>,
        #[serde(default)]
        complete_all: bool,
    },
    TaskList {
        name: String,
        serial: Vec<PlanSpec>,
        #[serde(default)]
        complete_all: bool,
    },
}

impl PlanSpec {
    /// Parses a YAML (or JSON) plan.
    pub fn parse(source: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, Error> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn name(&self) -> &str {
        match self {
            PlanSpec::Command { name, .. }
            | PlanSpec::TaskGroup { name, .. }
            | PlanSpec::TaskList { name, .. } => name,
        }
    }

    /// Builds the live task tree described by this plan.
    pub fn build(&self) -> Result<Arc<Task>, Error> {
        match self {
            PlanSpec::Command { name, args } => {
                let Some((program, args)) = args.split_first() else {
                    return Err(Error::EmptyCommand(name.clone()));
                };
                Ok(Task::shell(name.clone(), program.clone(), args.iter().cloned()))
            }
            PlanSpec::TaskGroup { name, parallel, parallelism, complete_all } => {
                let options = NestedOptions::new()
                    .parallelism(parallelism.unwrap_or(parallel.len()))
                    .complete_all(*complete_all);
                nested(name, options, parallel)
            }
            PlanSpec::TaskList { name, serial, complete_all } => {
                let options = NestedOptions::new()
                    .parallelism(1)
                    .complete_all(*complete_all);
                nested(name, options, serial)
            }
        }
    }
}

fn nested(
    name: &str,
    options: NestedOptions,
    children: &[PlanSpec],
) -> Result<Arc<Task>, Error> {
    let task = Task::nested(name, options);
    for child in children {
        task.add_child(child.build()?)?;
    }
    Ok(task)
}
