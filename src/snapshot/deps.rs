//! Feature dependency validation.

use std::collections::{BTreeMap, HashMap};

use crate::error::PublishError;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Validate the dependency graph of one team.
///
/// `features` yields `(key, dependency keys)`. Fails on a dependency naming an
/// unknown key or on any cycle (self-dependency included). Traversal order is
/// sorted by key so the reported cycle is stable.
pub fn check_dependencies<'a, I>(features: I) -> Result<(), PublishError>
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let graph: BTreeMap<&str, &[String]> = features.into_iter().collect();

    for (feature, deps) in &graph {
        if let Some(missing) = deps.iter().find(|d| !graph.contains_key(d.as_str())) {
            return Err(PublishError::UnknownDependency {
                feature: feature.to_string(),
                dependency: missing.clone(),
            });
        }
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();
    for key in graph.keys() {
        visit(*key, &graph, &mut marks, &mut path)?;
    }
    Ok(())
}

fn visit<'a>(
    key: &'a str,
    graph: &BTreeMap<&'a str, &'a [String]>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Result<(), PublishError> {
    match marks.get(key) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = path.iter().position(|k| *k == key).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|k| k.to_string()).collect();
            cycle.push(key.to_string());
            return Err(PublishError::DependencyCycle { cycle });
        }
        None => {}
    }

    marks.insert(key, Mark::Visiting);
    path.push(key);
    if let Some(&deps) = graph.get(key) {
        for dep in deps {
            visit(dep.as_str(), graph, marks, path)?;
        }
    }
    path.pop();
    marks.insert(key, Mark::Done);
    Ok(())
}
