//! Polygon layers stored as GeoJSON.
//!
//! We accept either a `FeatureCollection` document, or newline-delimited
//! `Feature` records. Each feature is converted to a [`PolygonFeature`], which
//! keeps the original GeoJSON geometry (so we can write it back out unchanged)
//! and a [`MultiPolygon`] used for matching and clipping.

use std::fmt;

use geo::{BoundingRect as _, Coord, LineString, MultiPolygon, Polygon, Rect};
use schemars::JsonSchema;

use crate::{errors::PipelineError, prelude::*};

/// A JSON Object value, without the surrounding [`Value::Object`] wrapper.
pub type JsonObject = serde_json::Map<String, Value>;

/// A GeoJSON position. Only the first two coordinates are used.
pub type Position = Vec<f64>;

/// The identifier of a feature, unique and stable within a run.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct FeatureId(pub i64);

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A coordinate reference system identifier, such as `EPSG:2180`.
#[derive(Clone, Debug, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Crs(String);

impl Crs {
    /// Build a CRS from an EPSG code.
    pub fn from_epsg(code: u32) -> Self {
        Self(format!("EPSG:{code}"))
    }

    /// Parse an authority id. We understand `AUTH:CODE` and the OGC URN form
    /// used by legacy GeoJSON, `urn:ogc:def:crs:AUTH::CODE`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("urn:ogc:def:crs:") {
            let mut parts = rest.split(':').filter(|p| !p.is_empty());
            let authority = parts.next();
            let code = parts.last();
            return match (authority, code) {
                (Some(authority), Some(code)) if authority.eq_ignore_ascii_case("ogc") => {
                    Ok(Self(format!("OGC:{code}")))
                }
                (Some(authority), Some(code)) => {
                    Ok(Self(format!("{}:{}", authority.to_ascii_uppercase(), code)))
                }
                _ => Err(anyhow!("cannot parse CRS URN {:?}", s)),
            };
        }
        match s.split_once(':') {
            Some((authority, code)) if !authority.is_empty() && !code.is_empty() => {
                Ok(Self(format!("{}:{}", authority.to_ascii_uppercase(), code)))
            }
            _ => Err(anyhow!("cannot parse CRS {:?} (expected e.g. EPSG:2180)", s)),
        }
    }

    /// The authority id, e.g. `EPSG:2180`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The OGC URN form, as written to a GeoJSON `crs` member.
    pub fn to_urn(&self) -> String {
        match self.as_str().split_once(':') {
            Some((authority, code)) => format!("urn:ogc:def:crs:{authority}::{code}"),
            None => self.0.clone(),
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for Crs {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A GeoJSON polygon geometry.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Geometry {
    /// A single polygon. The first ring is the exterior.
    Polygon { coordinates: Vec<Vec<Position>> },
    /// Several polygons.
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
}

impl Geometry {
    /// Convert to a [`MultiPolygon`].
    pub fn to_multi_polygon(&self) -> Result<MultiPolygon<f64>> {
        let polygons = match self {
            Geometry::Polygon { coordinates } => vec![polygon_from_rings(coordinates)?],
            Geometry::MultiPolygon { coordinates } => coordinates
                .iter()
                .map(|rings| polygon_from_rings(rings))
                .collect::<Result<Vec<_>>>()?,
        };
        if polygons.is_empty() {
            return Err(anyhow!("geometry contains no polygons"));
        }
        Ok(MultiPolygon::new(polygons))
    }
}

fn polygon_from_rings(rings: &[Vec<Position>]) -> Result<Polygon<f64>> {
    let mut rings = rings.iter().map(|ring| line_string_from_ring(ring));
    let exterior = rings
        .next()
        .ok_or_else(|| anyhow!("polygon has no exterior ring"))??;
    let interiors = rings.collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn line_string_from_ring(ring: &[Position]) -> Result<LineString<f64>> {
    let coords = ring
        .iter()
        .map(|position| match position.as_slice() {
            [x, y, ..] => Ok(Coord { x: *x, y: *y }),
            _ => Err(anyhow!("position {:?} has fewer than two coordinates", position)),
        })
        .collect::<Result<Vec<_>>>()?;
    if coords.len() < 3 {
        return Err(anyhow!("polygon ring has only {} positions", coords.len()));
    }
    Ok(LineString::new(coords))
}

/// The only GeoJSON type a feature record may have.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub enum FeatureType {
    Feature,
}

/// A GeoJSON feature as it appears on disk.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct FeatureRecord {
    /// Always `"Feature"`.
    #[serde(rename = "type")]
    pub kind: FeatureType,

    /// The feature id. Integers and integer strings are accepted. When absent,
    /// the feature's position in the layer is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    /// The polygon boundary.
    pub geometry: Option<Geometry>,

    /// Attribute values.
    #[serde(default)]
    pub properties: Option<JsonObject>,
}

/// A polygon feature read from the input layer.
#[derive(Clone, Debug)]
pub struct PolygonFeature {
    /// The feature id.
    pub id: FeatureId,

    /// The geometry, as read.
    pub geometry: Geometry,

    /// Attribute values. The recognized text is written here.
    pub properties: JsonObject,

    /// The geometry, converted for computation.
    shape: MultiPolygon<f64>,

    /// The bounding box of `shape`.
    envelope: Rect<f64>,
}

impl PolygonFeature {
    /// Create a feature from a geometry and attributes.
    pub fn new(id: FeatureId, geometry: Geometry, properties: JsonObject) -> Result<Self> {
        let shape = geometry
            .to_multi_polygon()
            .with_context(|| format!("invalid geometry for feature {id}"))?;
        let envelope = shape
            .bounding_rect()
            .ok_or_else(|| anyhow!("feature {id} has an empty geometry"))?;
        Ok(Self {
            id,
            geometry,
            properties,
            shape,
            envelope,
        })
    }

    /// Create a feature from a GeoJSON record found at `position` in the
    /// layer.
    pub fn from_record(record: FeatureRecord, position: usize) -> Result<Self> {
        let id = match &record.id {
            None => FeatureId(i64::try_from(position).context("layer is too large")?),
            Some(Value::Number(n)) => FeatureId(
                n.as_i64()
                    .ok_or_else(|| anyhow!("feature id {} is not an integer", n))?,
            ),
            Some(Value::String(s)) => FeatureId(
                s.trim()
                    .parse()
                    .with_context(|| format!("feature id {:?} is not an integer", s))?,
            ),
            Some(other) => return Err(anyhow!("unsupported feature id {}", other)),
        };
        let geometry = record
            .geometry
            .ok_or_else(|| anyhow!("feature {id} has no geometry"))?;
        Self::new(id, geometry, record.properties.unwrap_or_default())
    }

    /// The geometry used for matching and clipping.
    pub fn shape(&self) -> &MultiPolygon<f64> {
        &self.shape
    }

    /// The bounding box of the geometry.
    pub fn envelope(&self) -> Rect<f64> {
        self.envelope
    }

    /// Write `text` into the attribute `field`, replacing any prior value.
    pub fn stamp_text(&mut self, field: &str, text: String) {
        self.properties.insert(field.to_owned(), Value::String(text));
    }

    /// Convert to a GeoJSON feature value, with one property per schema field.
    pub fn to_geojson(&self, fields: &[String]) -> Value {
        let mut properties = JsonObject::new();
        for field in fields {
            let value = self.properties.get(field).cloned().unwrap_or(Value::Null);
            properties.insert(field.clone(), value);
        }
        serde_json::json!({
            "type": "Feature",
            "id": self.id,
            "geometry": self.geometry,
            "properties": properties,
        })
    }
}

/// A polygon layer.
#[derive(Debug)]
pub struct PolygonLayer {
    /// The features, in file order.
    pub features: Vec<PolygonFeature>,

    /// The attribute fields, in first-seen order.
    pub fields: Vec<String>,

    /// The layer CRS, if known.
    pub crs: Option<Crs>,
}

impl PolygonLayer {
    /// Build a layer from features.
    pub fn new(features: Vec<PolygonFeature>, crs: Option<Crs>) -> Self {
        let mut fields: Vec<String> = vec![];
        for feature in &features {
            for key in feature.properties.keys() {
                if !fields.contains(key) {
                    fields.push(key.clone());
                }
            }
        }
        Self {
            features,
            fields,
            crs,
        }
    }

    /// Read a GeoJSON layer from `path`.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn read(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read polygon layer {:?}", path))?;
        Self::from_geojson_str(&data)
            .with_context(|| format!("failed to parse polygon layer {:?}", path))
    }

    /// Parse a `FeatureCollection`, or a sequence of `Feature` records.
    pub fn from_geojson_str(data: &str) -> Result<Self> {
        let mut records = vec![];
        let mut crs = None;
        let values = serde_json::Deserializer::from_str(data).into_iter::<Value>();
        for value in values {
            let mut value = value.context("invalid JSON")?;
            match value.get("type").and_then(Value::as_str) {
                Some("FeatureCollection") => {
                    if let Some(name) = value
                        .pointer("/crs/properties/name")
                        .and_then(Value::as_str)
                    {
                        crs = Some(Crs::parse(name)?);
                    }
                    let features = value
                        .get_mut("features")
                        .map(Value::take)
                        .ok_or_else(|| anyhow!("FeatureCollection has no features"))?;
                    let features: Vec<FeatureRecord> = serde_json::from_value(features)
                        .context("invalid features in FeatureCollection")?;
                    records.extend(features);
                }
                Some("Feature") => {
                    records.push(
                        serde_json::from_value(value).context("invalid feature record")?,
                    );
                }
                other => {
                    return Err(anyhow!(
                        "expected a Feature or FeatureCollection, found type {:?}",
                        other
                    ));
                }
            }
        }
        let features = records
            .into_iter()
            .enumerate()
            .map(|(position, record)| PolygonFeature::from_record(record, position))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(features, crs))
    }

    /// Check that `field` exists and holds text, so it can receive the
    /// recognized text.
    pub fn check_text_field(&self, field: &str) -> Result<()> {
        if !self.fields.iter().any(|f| f == field) {
            return Err(PipelineError::configuration(format!(
                "field {:?} does not exist in the input layer (fields: {})",
                field,
                self.fields.join(", ")
            )));
        }
        let non_text = self.features.iter().find(|feature| {
            !matches!(
                feature.properties.get(field),
                None | Some(Value::Null) | Some(Value::String(_))
            )
        });
        if let Some(feature) = non_text {
            return Err(PipelineError::configuration(format!(
                "field {:?} is not a text field (feature {} holds {})",
                field, feature.id, feature.properties[field]
            )));
        }
        Ok(())
    }

    /// Find the feature at `position`.
    pub fn feature(&self, position: usize) -> Option<&PolygonFeature> {
        self.features.get(position)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// An axis-aligned square feature with a `text` field.
    pub(crate) fn square(id: i64, min_x: f64, min_y: f64, size: f64) -> PolygonFeature {
        let ring = vec![
            vec![min_x, min_y],
            vec![min_x + size, min_y],
            vec![min_x + size, min_y + size],
            vec![min_x, min_y + size],
            vec![min_x, min_y],
        ];
        let mut properties = JsonObject::new();
        properties.insert("name".to_owned(), Value::String(format!("feature {id}")));
        properties.insert("text".to_owned(), Value::Null);
        PolygonFeature::new(
            FeatureId(id),
            Geometry::Polygon {
                coordinates: vec![ring],
            },
            properties,
        )
        .unwrap()
    }

    static COLLECTION: &str = r#"{
        "type": "FeatureCollection",
        "crs": { "type": "name", "properties": { "name": "urn:ogc:def:crs:EPSG::2180" } },
        "features": [
            {
                "type": "Feature",
                "id": 7,
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0, 0], [10, 0], [10, 5, 1], [0, 5], [0, 0]]]
                },
                "properties": { "label": "a", "text": null }
            },
            {
                "type": "Feature",
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": [
                        [[[20, 20], [30, 20], [30, 30], [20, 20]]],
                        [[[40, 40], [50, 40], [50, 50], [40, 40]]]
                    ]
                },
                "properties": { "text": "old", "extra": 1 }
            }
        ]
    }"#;

    #[test]
    fn reads_feature_collection() {
        let layer = PolygonLayer::from_geojson_str(COLLECTION).unwrap();
        assert_eq!(layer.crs, Some(Crs::from_epsg(2180)));
        assert_eq!(layer.features.len(), 2);
        assert_eq!(layer.features[0].id, FeatureId(7));
        // Missing ids fall back to the position in the layer.
        assert_eq!(layer.features[1].id, FeatureId(1));
        assert_eq!(layer.fields, vec!["label", "text", "extra"]);
        let envelope = layer.features[1].envelope();
        assert_eq!(envelope.min(), Coord { x: 20.0, y: 20.0 });
        assert_eq!(envelope.max(), Coord { x: 50.0, y: 50.0 });
    }

    #[test]
    fn reads_jsonl_features() {
        let data = concat!(
            r#"{"type":"Feature","id":"3","geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,0]]]},"properties":{"text":null}}"#,
            "\n",
            r#"{"type":"Feature","id":4,"geometry":{"type":"Polygon","coordinates":[[[2,2],[3,2],[3,3],[2,2]]]},"properties":{"text":null}}"#,
            "\n",
        );
        let layer = PolygonLayer::from_geojson_str(data).unwrap();
        let ids = layer.features.iter().map(|f| f.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![FeatureId(3), FeatureId(4)]);
        assert_eq!(layer.crs, None);
    }

    #[test]
    fn rejects_non_polygon_geometry() {
        let data = r#"{"type":"Feature","geometry":{"type":"Point","coordinates":[0,0]}}"#;
        assert!(PolygonLayer::from_geojson_str(data).is_err());
    }

    #[test]
    fn checks_text_field() {
        let layer = PolygonLayer::from_geojson_str(COLLECTION).unwrap();
        assert!(layer.check_text_field("text").is_ok());
        assert!(layer.check_text_field("label").is_ok());

        let err = layer.check_text_field("missing").unwrap_err();
        assert!(PipelineError::is_configuration(&err));
        let err = layer.check_text_field("extra").unwrap_err();
        assert!(PipelineError::is_configuration(&err));
    }

    #[test]
    fn parses_crs_names() {
        assert_eq!(Crs::parse("epsg:4326").unwrap().as_str(), "EPSG:4326");
        assert_eq!(
            Crs::parse("urn:ogc:def:crs:EPSG::2180").unwrap().as_str(),
            "EPSG:2180"
        );
        assert_eq!(
            Crs::parse("urn:ogc:def:crs:OGC:1.3:CRS84").unwrap().as_str(),
            "OGC:CRS84"
        );
        assert!(Crs::parse("2180").is_err());
        assert_eq!(
            Crs::from_epsg(2180).to_urn(),
            "urn:ogc:def:crs:EPSG::2180"
        );
    }

    #[test]
    fn geojson_output_has_every_field() {
        let mut feature = square(1, 0.0, 0.0, 1.0);
        feature.stamp_text("text", "hello".to_owned());
        let fields = vec!["name".to_owned(), "text".to_owned(), "other".to_owned()];
        let value = feature.to_geojson(&fields);
        assert_eq!(value["id"], 1);
        assert_eq!(value["properties"]["text"], "hello");
        assert_eq!(value["properties"]["other"], Value::Null);
        assert_eq!(value["geometry"]["type"], "Polygon");
    }
}
