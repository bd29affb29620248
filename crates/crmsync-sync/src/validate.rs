//! Per-entity record validation: raw CRM rows in, canonical entities out.
//!
//! Every entity needs its CRM id and a name that is still non-empty after
//! normalization. Everything else falls back to `NULL` or a numeric default.

use crmsync_core::{City, MegaProject, Project, ProjectAttribute, RawRecord, Typology};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Why a record was left out of the batch. Counted, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationSkip {
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),
    #[error("field `{0}` is empty after normalization")]
    EmptyAfterNormalization(&'static str),
}

/// `"Springfield/Metro"` becomes `"Springfield"`.
pub fn normalize_city_name(raw: &str) -> &str {
    raw.split('/').next().unwrap_or_default().trim()
}

/// Comma separated image URLs, blanks dropped.
pub fn parse_gallery(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn required(record: &RawRecord, field: &'static str) -> Result<String, ValidationSkip> {
    record.text(field).ok_or(ValidationSkip::MissingField(field))
}

fn required_name(
    record: &RawRecord,
    field: &'static str,
    normalize: fn(&str) -> &str,
) -> Result<String, ValidationSkip> {
    let raw = required(record, field)?;
    let name = normalize(&raw);
    if name.is_empty() {
        return Err(ValidationSkip::EmptyAfterNormalization(field));
    }
    Ok(name.to_string())
}

fn non_blank_json(record: &RawRecord, field: &str) -> Option<JsonValue> {
    record
        .get(field)
        .filter(|value| match value {
            JsonValue::String(s) => !s.trim().is_empty(),
            JsonValue::Array(items) => !items.is_empty(),
            _ => true,
        })
        .cloned()
}

pub fn validate_city(record: &RawRecord) -> Result<City, ValidationSkip> {
    Ok(City {
        id: required(record, "Ciudad.id")?,
        name: required_name(record, "Ciudad.Name", normalize_city_name)?,
        is_public: true,
    })
}

pub fn validate_project_attribute(record: &RawRecord) -> Result<ProjectAttribute, ValidationSkip> {
    Ok(ProjectAttribute {
        id: required(record, "id")?,
        name: required_name(record, "Nombre_atributo", str::trim)?,
    })
}

pub fn validate_mega_project(record: &RawRecord) -> Result<MegaProject, ValidationSkip> {
    Ok(MegaProject {
        id: required(record, "id")?,
        name: required_name(record, "Name", str::trim)?,
        address: record.text("Direccion_MP"),
        slogan: record.text("Slogan_comercial"),
        description: record.text("Descripcion"),
        attributes: None,
        gallery: parse_gallery(record.text("Record_Image").as_deref()),
        latitude: record.float_or("Latitud_MP", 0.0),
        longitude: record.float_or("Longitud_MP", 0.0),
        is_public: false,
    })
}

pub fn validate_project(record: &RawRecord) -> Result<Project, ValidationSkip> {
    Ok(Project {
        hc: required(record, "id")?,
        name: required_name(record, "Name", str::trim)?,
        slogan: record.text("Slogan"),
        address: record.text("Direccion"),
        small_description: record.text("Descripcion_corta"),
        long_description: record.text("Descripcion_larga"),
        sic: record.text("SIG"),
        sales_room_name: record.text("Sala_de_ventas.Name"),
        salary_minimum_count: record.int_or("Cantidad_SMMLV", 0),
        discount_description: record.text("Descripcion_descuento"),
        price_from_general: record.float_or("Precios_desde", 0.0),
        price_up_general: record.float_or("Precios_hasta", 0.0),
        project_type: record.text("Tipo_de_proyecto"),
        mega_project_id: record.text("Mega_Proyecto.id"),
        status: non_blank_json(record, "Estado"),
        highlighted: record.flag("Proyecto_destacado"),
        built_area: record.float_or("Area_construida_desde", 0.0),
        private_area: record.float_or("Area_construida_hasta", 0.0),
        rooms: record.max_int_or_zero("Habitaciones"),
        bathrooms: record.max_int_or_zero("Ba_os"),
        latitude: record.float_or("Latitud", 0.0),
        longitude: record.float_or("Longitud", 0.0),
        is_public: false,
        attributes: None,
    })
}

/// Typologies carry no parent reference of their own; `project_hc` comes from the lookup.
pub fn validate_typology(record: &RawRecord, project_hc: &str) -> Result<Typology, ValidationSkip> {
    Ok(Typology {
        id: required(record, "id")?,
        project_id: project_hc.to_string(),
        name: required_name(record, "Nombre", str::trim)?,
        description: record.text("Descripci_n"),
        price_from: record.float_or("Precio_desde", 0.0),
        price_up: 0.0,
        rooms: record.int_or("Habitaciones", 0),
        bathrooms: record.int_or("Ba_os", 0),
        built_area: record.float_or("Area_construida", 0.0),
        private_area: record.float_or("Area_privada", 0.0),
    })
}
