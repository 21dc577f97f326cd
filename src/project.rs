//! Project files, listing the layers available to a run.
//!
//! ```toml
//! [[layers]]
//! name = "sheet-12"
//! path = "rasters/sheet-12.tif"
//! active = true
//! kind = "raster"
//! ```

use schemars::JsonSchema;

use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// What a project layer holds.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// A raster, such as a GeoTIFF.
    #[default]
    Raster,
    /// A vector layer. These are listed but never processed.
    Vector,
}

/// One layer in a project.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectLayer {
    /// A display name. Used in logs and output.
    pub name: String,

    /// Where the layer lives. Relative paths are relative to the project
    /// file.
    pub path: PathBuf,

    /// Is the layer switched on?
    #[serde(default = "default_active")]
    pub active: bool,

    /// What the layer holds.
    #[serde(default)]
    pub kind: LayerKind,
}

fn default_active() -> bool {
    true
}

/// A list of layers, in display order.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Project {
    /// Layers, in order.
    #[serde(default)]
    pub layers: Vec<ProjectLayer>,
}

impl Project {
    /// Load a project from a TOML or JSON file.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self> {
        let mut project: Project = read_json_or_toml(path).await?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        project.resolve_paths(base);
        debug!(layers = project.layers.len(), "Loaded project");
        Ok(project)
    }

    /// Make every relative layer path relative to `base` instead.
    fn resolve_paths(&mut self, base: &Path) {
        for layer in &mut self.layers {
            if layer.path.is_relative() {
                layer.path = base.join(&layer.path);
            }
        }
    }

    /// Active raster layers, in order.
    pub fn active_rasters(&self) -> impl Iterator<Item = &ProjectLayer> {
        self.layers
            .iter()
            .filter(|layer| layer.active && layer.kind == LayerKind::Raster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PROJECT: &str = r#"
[[layers]]
name = "sheet-1"
path = "rasters/sheet-1.tif"

[[layers]]
name = "parcels"
path = "parcels.geojson"
kind = "vector"

[[layers]]
name = "sheet-2"
path = "/data/sheet-2.tif"
active = false

[[layers]]
name = "sheet-3"
path = "sheet-3.tif"
active = true
kind = "raster"
"#;

    #[tokio::test]
    async fn loads_project_and_resolves_paths() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("project-test")?;
        let path = tmpdir.path().join("project.toml");
        tokio::fs::write(&path, PROJECT).await?;

        let project = Project::load(&path).await?;
        assert_eq!(project.layers.len(), 4);
        assert_eq!(
            project.layers[0].path,
            tmpdir.path().join("rasters/sheet-1.tif")
        );
        assert_eq!(project.layers[2].path, Path::new("/data/sheet-2.tif"));

        let active = project
            .active_rasters()
            .map(|layer| layer.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(active, vec!["sheet-1", "sheet-3"]);
        Ok(())
    }

    #[tokio::test]
    async fn loads_json_projects() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("project-test")?;
        let path = tmpdir.path().join("project.json");
        tokio::fs::write(
            &path,
            r#"{"layers": [{"name": "a", "path": "a.tif", "active": false}]}"#,
        )
        .await?;
        let project = Project::load(&path).await?;
        assert_eq!(project.layers[0].kind, LayerKind::Raster);
        assert_eq!(project.active_rasters().count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_unknown_keys() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("project-test")?;
        let path = tmpdir.path().join("project.toml");
        tokio::fs::write(&path, "[[layers]]\nname = \"a\"\npath = \"a.tif\"\nvisible = true\n")
            .await?;
        assert!(Project::load(&path).await.is_err());
        Ok(())
    }
}
