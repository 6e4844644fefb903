//! What to run on the nodes.
//!
//! A workload supplies the installer request and the per-item request. The bundled
//! [`TemplateWorkload`] renders them from handlebars templates, usually loaded from a YAML
//! file like:
//!
//! ```yaml
//! installer:
//!   command:
//!     - tar xzf blender.tgz
//!     - ./blender --version
//!   upload: blender.tgz
//! command: ./render.sh {{item}} > frame_{{item}}.png
//! output: frame_{{item}}.png
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use handlebars::Handlebars;
use serde::Deserialize;
use void::Void;

use crate::error::Result;
use crate::executor::{Download, RemoteCommand, Upload};
use crate::node::Node;
use crate::queue::WorkItem;
use crate::serde::{optional_shell_steps, shell_steps_or_mapping};

/// Produces the requests sent to nodes. Implementations must be cheap to call per item.
pub trait Workload: Send + Sync {
    /// The installer request for `node`, or `None` if nodes need no installation.
    fn installer(&self, node: &Node) -> Result<Option<RemoteCommand>>;

    /// The request that performs one attempt at `item` on `node`.
    fn item_command(&self, node: &Node, item: WorkItem) -> Result<RemoteCommand>;
}

pub const DEFAULT_ITEM_COMMAND: &str = "hostname > frame_{{item}}.out";
pub const DEFAULT_ITEM_OUTPUT: &str = "frame_{{item}}.out";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallerSpec {
    #[serde(default, deserialize_with = "optional_shell_steps")]
    pub command: Option<String>,
    /// Local file copied to the node's home directory before the installer runs.
    #[serde(default)]
    pub upload: Option<PathBuf>,
}

impl InstallerSpec {
    pub fn is_empty(&self) -> bool {
        self.command.is_none() && self.upload.is_none()
    }
}

impl FromStr for InstallerSpec {
    type Err = Void;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self {
            command: Some(s.to_string()),
            upload: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstallerField(#[serde(deserialize_with = "shell_steps_or_mapping")] pub InstallerSpec);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadSpec {
    #[serde(default)]
    pub installer: Option<InstallerField>,
    /// Item command template.
    pub command: String,
    /// Remote artifact fetched after a successful item, if any.
    #[serde(default)]
    pub output: Option<String>,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            installer: None,
            command: DEFAULT_ITEM_COMMAND.to_string(),
            output: Some(DEFAULT_ITEM_OUTPUT.to_string()),
        }
    }
}

impl WorkloadSpec {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn installer_spec(&self) -> Option<&InstallerSpec> {
        self.installer.as_ref().map(|InstallerField(spec)| spec)
    }
}

const INSTALLER: &str = "installer";
const COMMAND: &str = "command";
const OUTPUT: &str = "output";

pub struct TemplateWorkload {
    registry: Handlebars<'static>,
    upload: Option<PathBuf>,
    has_installer_command: bool,
    has_output: bool,
    data_dir: PathBuf,
}

impl TemplateWorkload {
    /// Compiles the templates in `spec`. Retrieved artifacts land in `data_dir`.
    pub fn new(spec: &WorkloadSpec, data_dir: &Path) -> Result<Self> {
        let mut registry = Handlebars::new();
        handlebars_misc_helpers::register(&mut registry);
        // Commands are shell, not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(true);

        let installer = spec.installer_spec().cloned().unwrap_or_default();
        if let Some(command) = &installer.command {
            registry.register_template_string(INSTALLER, command)?;
        }
        registry.register_template_string(COMMAND, &spec.command)?;
        if let Some(output) = &spec.output {
            registry.register_template_string(OUTPUT, output)?;
        }

        Ok(Self {
            registry,
            has_installer_command: installer.command.is_some(),
            upload: installer.upload,
            has_output: spec.output.is_some(),
            data_dir: data_dir.to_path_buf(),
        })
    }

    fn params(node: &Node, item: Option<WorkItem>) -> HashMap<&'static str, String> {
        let mut params = HashMap::new();
        params.insert("instanceId", node.id.clone());
        if let Some(item) = item {
            params.insert("item", item.id.to_string());
            params.insert("attempt", (item.attempts + 1).to_string());
        }
        params
    }
}

impl Workload for TemplateWorkload {
    fn installer(&self, node: &Node) -> Result<Option<RemoteCommand>> {
        if !self.has_installer_command && self.upload.is_none() {
            return Ok(None);
        }
        let command = if self.has_installer_command {
            Some(self.registry.render(INSTALLER, &Self::params(node, None))?)
        } else {
            None
        };
        let upload = self.upload.as_ref().map(|local_path| Upload {
            remote_name: local_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| local_path.display().to_string()),
            local_path: local_path.clone(),
        });
        Ok(Some(RemoteCommand {
            command,
            upload,
            download: None,
        }))
    }

    fn item_command(&self, node: &Node, item: WorkItem) -> Result<RemoteCommand> {
        let params = Self::params(node, Some(item));
        let download = if self.has_output {
            Some(Download {
                remote_name: self.registry.render(OUTPUT, &params)?,
                local_dir: self.data_dir.clone(),
            })
        } else {
            None
        };
        Ok(RemoteCommand {
            command: Some(self.registry.render(COMMAND, &params)?),
            upload: None,
            download,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::node::{nominal_rating, NodeDescriptor};

    fn node() -> Node {
        let desc: NodeDescriptor = serde_json::from_value(serde_json::json!({
            "instanceId": "i-42", "state": "started", "ssh": {"host": "h", "user": "u"}
        }))
        .unwrap();
        Node::from_descriptor(desc, nominal_rating).unwrap()
    }

    #[test]
    fn default_workload_writes_and_fetches_frame_files() {
        let workload = TemplateWorkload::new(&WorkloadSpec::default(), Path::new("/data")).unwrap();
        assert_eq!(workload.installer(&node()).unwrap(), None);

        let request = workload.item_command(&node(), WorkItem::new(7)).unwrap();
        assert_eq!(request.command.as_deref(), Some("hostname > frame_7.out"));
        let download = request.download.unwrap();
        assert_eq!(download.remote_name, "frame_7.out");
        assert_eq!(download.local_dir, PathBuf::from("/data"));
    }

    #[test]
    fn yaml_workload_with_steps_and_upload() {
        let yaml = r#"
installer:
  command:
    - tar xzf pkg.tgz
    - ./pkg/setup '{{instanceId}}'
  upload: /tmp/pkg.tgz
command: ./pkg/run {{item}} {{attempt}} > out_{{item}}.txt
"#;
        let spec: WorkloadSpec = serde_yaml::from_str(yaml).unwrap();
        let workload = TemplateWorkload::new(&spec, Path::new("/data")).unwrap();

        let installer = workload.installer(&node()).unwrap().unwrap();
        assert_eq!(
            installer.command.as_deref(),
            Some("tar xzf pkg.tgz && ./pkg/setup 'i-42'")
        );
        let upload = installer.upload.unwrap();
        assert_eq!(upload.remote_name, "pkg.tgz");

        let item = WorkItem { id: 3, attempts: 1 };
        let request = workload.item_command(&node(), item).unwrap();
        assert_eq!(request.command.as_deref(), Some("./pkg/run 3 2 > out_3.txt"));
        assert!(request.download.is_none());
    }

    #[test]
    fn bare_string_installer() {
        let spec: WorkloadSpec =
            serde_yaml::from_str("installer: apt-get install -y ffmpeg\ncommand: echo {{item}}\n")
                .unwrap();
        let installer = spec.installer_spec().unwrap();
        assert_eq!(installer.command.as_deref(), Some("apt-get install -y ffmpeg"));
        assert!(installer.upload.is_none());
    }

    #[test]
    fn unknown_placeholder_fails_to_render() {
        let spec = WorkloadSpec {
            installer: None,
            command: "echo {{frame}}".to_string(),
            output: None,
        };
        let workload = TemplateWorkload::new(&spec, Path::new("/data")).unwrap();
        assert!(workload.item_command(&node(), WorkItem::new(1)).is_err());
    }

    #[test]
    fn shell_characters_are_not_escaped() {
        let spec = WorkloadSpec {
            installer: None,
            command: "echo \"{{item}}\" > a&b <{{instanceId}}>".to_string(),
            output: None,
        };
        let workload = TemplateWorkload::new(&spec, Path::new("/data")).unwrap();
        let request = workload.item_command(&node(), WorkItem::new(1)).unwrap();
        assert_eq!(request.command.as_deref(), Some("echo \"1\" > a&b <i-42>"));
    }
}
