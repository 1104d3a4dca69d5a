//! Pipeline definition parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use pinbuild_core::pipeline::{
    ComponentSpec, DependencySpec, ManifestSpec, PackageSpec, ParentSpec, PipelineDefinition,
    ReportSpec,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Read and parse a pipeline definition file.
pub fn load_pipeline(path: &Path) -> ConfigResult<PipelineDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_pipeline(&content)
}

/// Parse a pipeline definition from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut dependency = None;
    let mut parent = None;
    let mut env = BTreeMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "dependency" => {
                if dependency.is_some() {
                    return Err(ConfigError::Duplicate("dependency".to_string()));
                }
                dependency = Some(parse_dependency(node)?);
            }
            "parent" => {
                if parent.is_some() {
                    return Err(ConfigError::Duplicate("parent".to_string()));
                }
                parent = Some(parse_parent(node)?);
            }
            "env" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        let key = child.name().value().to_string();
                        if let Some(val) = get_first_string_arg(child) {
                            env.insert(key, val);
                        }
                    }
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }
    let dependency =
        dependency.ok_or_else(|| ConfigError::MissingField("dependency".to_string()))?;
    let parent = parent.ok_or_else(|| ConfigError::MissingField("parent".to_string()))?;

    if dependency.component.name == parent.component.name {
        return Err(ConfigError::Duplicate(format!(
            "component '{}' declared as both dependency and parent",
            parent.component.name
        )));
    }
    if dependency.component.dir_var == parent.component.dir_var {
        return Err(ConfigError::Duplicate(format!(
            "dir-var '{}' used by both components",
            parent.component.dir_var
        )));
    }

    Ok(PipelineDefinition {
        name,
        dependency,
        parent,
        env,
    })
}

fn parse_dependency(node: &KdlNode) -> ConfigResult<DependencySpec> {
    let mut component = new_component(node, "dependency")?;
    let mut output_dir = None;
    let mut output_var = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if parse_component_child(child, &mut component)? {
                continue;
            }
            match child.name().value() {
                "output-dir" => output_dir = get_first_string_arg(child).map(PathBuf::from),
                "output-var" => output_var = get_first_string_arg(child),
                _ => {}
            }
        }
    }

    if output_var.is_some() && output_dir.is_none() {
        return Err(ConfigError::MissingField(format!(
            "output-dir for dependency '{}' (output-var is set)",
            component.name
        )));
    }
    validate_component(&component)?;

    Ok(DependencySpec {
        component,
        output_dir,
        output_var,
    })
}

fn parse_parent(node: &KdlNode) -> ConfigResult<ParentSpec> {
    let component = new_component(node, "parent")?;
    let mut parent = ParentSpec {
        component,
        version_file: PathBuf::from("VERSION"),
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if parse_component_child(child, &mut parent.component)? {
                continue;
            }
            match child.name().value() {
                "manifest" => parent.manifest = parse_manifest(child)?,
                "version-file" => {
                    parent.version_file = get_first_string_arg(child)
                        .map(PathBuf::from)
                        .ok_or_else(|| ConfigError::MissingField("version-file path".to_string()))?;
                }
                "stamp" => parent
                    .stamp_files
                    .extend(get_all_string_args(child).into_iter().map(PathBuf::from)),
                "dist" => {
                    let defaults = PackageSpec::default();
                    parent.package = PackageSpec {
                        dir: get_first_string_arg(child)
                            .map(PathBuf::from)
                            .unwrap_or(defaults.dir),
                        extension: get_string_prop(child, "extension")
                            .unwrap_or(defaults.extension),
                    };
                }
                "marker" => parent.marker = get_first_string_arg(child).map(PathBuf::from),
                "install" => parent.install = get_run_commands(child),
                "test" => parent.test = get_run_commands(child),
                "report" => {
                    let defaults = ReportSpec::default();
                    parent.report = ReportSpec {
                        dir: get_first_string_arg(child)
                            .map(PathBuf::from)
                            .unwrap_or(defaults.dir),
                        extension: get_string_prop(child, "extension")
                            .unwrap_or(defaults.extension),
                    };
                }
                _ => {}
            }
        }
    }

    if parent.stamp_files.is_empty() {
        parent.stamp_files.push(parent.version_file.clone());
    }
    validate_component(&parent.component)?;

    Ok(parent)
}

fn parse_manifest(node: &KdlNode) -> ConfigResult<ManifestSpec> {
    let defaults = ManifestSpec::default();
    Ok(ManifestSpec {
        path: get_first_string_arg(node)
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::MissingField("manifest path".to_string()))?,
        remote_key: get_string_prop(node, "remote-key").unwrap_or(defaults.remote_key),
        revision_key: get_string_prop(node, "revision-key").unwrap_or(defaults.revision_key),
    })
}

fn new_component(node: &KdlNode, role: &str) -> ConfigResult<ComponentSpec> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("{} name", role)))?;
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ConfigError::InvalidValue {
            field: format!("{} name", role),
            message: format!("'{}' cannot be used as a directory name", name),
        });
    }
    Ok(ComponentSpec {
        dir_var: default_dir_var(&name),
        name,
        ..Default::default()
    })
}

/// Handle children shared by both component kinds. Returns true if consumed.
fn parse_component_child(child: &KdlNode, component: &mut ComponentSpec) -> ConfigResult<bool> {
    match child.name().value() {
        "dir-var" => {
            component.dir_var = get_first_string_arg(child)
                .ok_or_else(|| ConfigError::MissingField("dir-var value".to_string()))?;
        }
        "clean" => component
            .clean
            .extend(get_all_string_args(child).into_iter().map(PathBuf::from)),
        "exclude" => component
            .exclude
            .extend(get_all_string_args(child).into_iter().map(PathBuf::from)),
        "build" => component.build = get_run_commands(child),
        "package" => component.package = get_run_commands(child),
        "ci-package" => component.ci_package = get_run_commands(child),
        _ => return Ok(false),
    }
    Ok(true)
}

fn validate_component(component: &ComponentSpec) -> ConfigResult<()> {
    if component.build.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "build commands for '{}'",
            component.name
        )));
    }
    for path in component.clean.iter().chain(&component.exclude) {
        if path.is_absolute() || path.components().any(|c| c.as_os_str() == "..") {
            return Err(ConfigError::InvalidValue {
                field: format!("clean/exclude of '{}'", component.name),
                message: format!("{} must stay inside the component tree", path.display()),
            });
        }
    }
    Ok(())
}

/// `nupic.core` -> `NUPIC_CORE_DIR`
fn default_dir_var(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_DIR", stem)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Collect `run "..."` children of a command block.
fn get_run_commands(node: &KdlNode) -> Vec<String> {
    node.children()
        .map(|children| {
            children
                .nodes()
                .iter()
                .filter(|c| c.name().value() == "run")
                .filter_map(get_first_string_arg)
                .collect()
        })
        .unwrap_or_default()
}
