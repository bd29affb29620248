//! Registry of mirrored entity types. Each entry parameterizes the one generic pipeline.

use crmsync_core::{CanonicalEntity, EntityKind, EntityRow, RawRecord};
use crmsync_crm::QueryDescriptor;
use crmsync_storage::{UniqueConstraint, UpsertStatement};

use crate::validate::{
    validate_city, validate_mega_project, validate_project, validate_project_attribute,
    validate_typology, ValidationSkip,
};

pub type RowValidator = fn(&RawRecord) -> Result<EntityRow, ValidationSkip>;
pub type ChildValidator = fn(&RawRecord, &str) -> Result<EntityRow, ValidationSkip>;

pub const CITIES: UpsertStatement = UpsertStatement {
    table: "Cities",
    key_column: "id",
    columns: &["id", "name", "is_public"],
    unique_constraints: &[UniqueConstraint {
        name: "Cities_name_key",
        column: "name",
    }],
};

pub const PROJECT_ATTRIBUTES: UpsertStatement = UpsertStatement {
    table: "Project_Attributes",
    key_column: "id",
    columns: &["id", "name"],
    unique_constraints: &[UniqueConstraint {
        name: "Project_Attributes_name_key",
        column: "name",
    }],
};

pub const MEGA_PROJECTS: UpsertStatement = UpsertStatement {
    table: "Mega_Projects",
    key_column: "id",
    columns: &[
        "id",
        "name",
        "address",
        "slogan",
        "description",
        "attributes",
        "gallery",
        "latitude",
        "longitude",
        "is_public",
    ],
    unique_constraints: &[],
};

pub const PROJECTS: UpsertStatement = UpsertStatement {
    table: "Projects",
    key_column: "hc",
    columns: &[
        "hc",
        "name",
        "slogan",
        "address",
        "small_description",
        "long_description",
        "sic",
        "sales_room_name",
        "salary_minimum_count",
        "discount_description",
        "price_from_general",
        "price_up_general",
        "type",
        "mega_project_id",
        "status",
        "highlighted",
        "built_area",
        "private_area",
        "rooms",
        "bathrooms",
        "latitude",
        "longitude",
        "is_public",
        "attributes",
    ],
    unique_constraints: &[],
};

pub const TYPOLOGIES: UpsertStatement = UpsertStatement {
    table: "Typologies",
    key_column: "id",
    columns: &[
        "id",
        "project_id",
        "name",
        "description",
        "price_from",
        "price_up",
        "rooms",
        "bathrooms",
        "built_area",
        "private_area",
        "plans",
        "gallery",
    ],
    unique_constraints: &[],
};

/// Related CRM records stored as a JSON array column on the parent row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedLookup {
    pub module: &'static str,
    pub column: &'static str,
}

/// Related CRM records upserted into their own table after the parent row.
#[derive(Debug, Clone, Copy)]
pub struct ChildLookup {
    pub module: &'static str,
    pub statement: UpsertStatement,
    pub validate: ChildValidator,
}

/// Everything that distinguishes one entity pipeline from another.
#[derive(Debug, Clone)]
pub struct EntitySpec {
    pub kind: EntityKind,
    pub query: QueryDescriptor,
    /// Natural key in the raw record, used for deduplication.
    pub key_field: &'static str,
    pub validate: RowValidator,
    pub statement: UpsertStatement,
    pub embedded: Option<EmbeddedLookup>,
    pub children: Option<ChildLookup>,
}

fn to_row<E: CanonicalEntity>(entity: Result<E, ValidationSkip>) -> Result<EntityRow, ValidationSkip> {
    entity.map(|entity| entity.to_row())
}

fn city_row(record: &RawRecord) -> Result<EntityRow, ValidationSkip> {
    to_row(validate_city(record))
}

fn project_attribute_row(record: &RawRecord) -> Result<EntityRow, ValidationSkip> {
    to_row(validate_project_attribute(record))
}

fn mega_project_row(record: &RawRecord) -> Result<EntityRow, ValidationSkip> {
    to_row(validate_mega_project(record))
}

fn project_row(record: &RawRecord) -> Result<EntityRow, ValidationSkip> {
    to_row(validate_project(record))
}

fn typology_row(record: &RawRecord, project_hc: &str) -> Result<EntityRow, ValidationSkip> {
    to_row(validate_typology(record, project_hc))
}

impl EntitySpec {
    pub fn for_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Cities => Self {
                kind,
                query: QueryDescriptor::select("Proyectos_Comerciales", &["Ciudad.Name", "Ciudad.id"])
                    .filter("Ciudad is not null"),
                key_field: "Ciudad.id",
                validate: city_row,
                statement: CITIES,
                embedded: None,
                children: None,
            },
            EntityKind::ProjectAttributes => Self {
                kind,
                query: QueryDescriptor::select("Parametros", &["id", "Nombre_atributo"])
                    .filter("Tipo = 'Atributo'"),
                key_field: "id",
                validate: project_attribute_row,
                statement: PROJECT_ATTRIBUTES,
                embedded: None,
                children: None,
            },
            EntityKind::MegaProjects => Self {
                kind,
                query: QueryDescriptor::select(
                    "Mega_Proyectos",
                    &[
                        "id",
                        "Name",
                        "Direccion_MP",
                        "Slogan_comercial",
                        "Descripcion",
                        "Record_Image",
                        "Latitud_MP",
                        "Longitud_MP",
                    ],
                )
                .filter("id is not null"),
                key_field: "id",
                validate: mega_project_row,
                statement: MEGA_PROJECTS,
                embedded: Some(EmbeddedLookup {
                    module: "Atributos_Mega_Proyecto",
                    column: "attributes",
                }),
                children: None,
            },
            EntityKind::Projects => Self {
                kind,
                query: QueryDescriptor::select(
                    "Proyectos_Comerciales",
                    &[
                        "id",
                        "Name",
                        "Slogan",
                        "Direccion",
                        "Descripcion_corta",
                        "Descripcion_larga",
                        "SIG",
                        "Sala_de_ventas.Name",
                        "Cantidad_SMMLV",
                        "Descripcion_descuento",
                        "Precios_desde",
                        "Precios_hasta",
                        "Tipo_de_proyecto",
                        "Mega_Proyecto.id",
                        "Estado",
                        "Proyecto_destacado",
                        "Area_construida_desde",
                        "Area_construida_hasta",
                        "Habitaciones",
                        "Ba_os",
                        "Latitud",
                        "Longitud",
                    ],
                )
                .filter("id is not null"),
                key_field: "id",
                validate: project_row,
                statement: PROJECTS,
                embedded: Some(EmbeddedLookup {
                    module: "Atributos",
                    column: "attributes",
                }),
                children: Some(ChildLookup {
                    module: "Tipologias",
                    statement: TYPOLOGIES,
                    validate: typology_row,
                }),
            },
        }
    }

    pub fn all() -> Vec<Self> {
        EntityKind::ALL.into_iter().map(Self::for_kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmsync_core::ColumnValue;
    use serde_json::json;

    #[test]
    fn every_validator_fills_every_statement_column() {
        let samples = [
            (EntityKind::Cities, json!({"Ciudad.id": "1", "Ciudad.Name": "Cali"})),
            (EntityKind::ProjectAttributes, json!({"id": "1", "Nombre_atributo": "Gym"})),
            (EntityKind::MegaProjects, json!({"id": "1", "Name": "MP"})),
            (EntityKind::Projects, json!({"id": "1", "Name": "P"})),
        ];
        for (kind, raw) in samples {
            let spec = EntitySpec::for_kind(kind);
            let row = (spec.validate)(&serde_json::from_value(raw).unwrap()).unwrap();
            for column in spec.statement.columns {
                assert!(row.get(column).is_some(), "{kind}: missing {column}");
            }
            assert_eq!(row.get(spec.statement.key_column), Some(&ColumnValue::text("1")));
        }

        let children = EntitySpec::for_kind(EntityKind::Projects).children.unwrap();
        let child = (children.validate)(
            &serde_json::from_value(json!({"id": "t1", "Nombre": "T"})).unwrap(),
            "1",
        )
        .unwrap();
        for column in children.statement.columns {
            assert!(child.get(column).is_some(), "typology: missing {column}");
        }
    }

    #[test]
    fn cities_query_targets_the_project_join() {
        let spec = EntitySpec::for_kind(EntityKind::Cities);
        assert_eq!(
            spec.query.to_coql(),
            "SELECT Ciudad.Name, Ciudad.id FROM Proyectos_Comerciales WHERE Ciudad is not null LIMIT 0,200"
        );
    }

    #[test]
    fn registry_covers_every_kind_once() {
        let kinds = EntitySpec::all().into_iter().map(|s| s.kind).collect::<Vec<_>>();
        assert_eq!(kinds, EntityKind::ALL.to_vec());
    }
}
