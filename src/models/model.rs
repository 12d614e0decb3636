//! Declarative model definitions.
//!
//! A model is any type implementing [`Model`]. It declares its own columns
//! and attaches reusable [`FieldSet`]s (soft delete, timestamps, user audit)
//! that contribute standard columns. [`ModelDescriptor`] is the flattened,
//! ordered description the registry and the migration tooling consume.

use serde::Serialize;
use std::any::TypeId;

/// Sort order of primary key columns.
pub const SORT_PRIMARY_KEY: i32 = -999;
/// Sort order of columns declared by the model itself.
pub const SORT_MODEL: i32 = 0;
pub const SORT_SOFT_DELETE: i32 = 997;
pub const SORT_USER_AUDIT: i32 = 998;
pub const SORT_TIMESTAMPS: i32 = 999;

/// Logical column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnType {
    BigInt,
    Integer,
    Boolean,
    VarChar { length: u32 },
    Text,
    /// Timezone-aware timestamp.
    DateTime,
    Json,
    Decimal { precision: u8, scale: u8 },
}

/// Where a column's value comes from when the application does not set it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnDefault {
    /// Next id from the process-wide snowflake generator.
    Snowflake,
    /// Current timestamp.
    Now,
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub index: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<ColumnDefault>,
    /// Refreshed on every update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_update: Option<ColumnDefault>,
    pub comment: String,
    pub sort_order: i32,
}

impl ColumnDef {
    /// A non-null model column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            primary_key: false,
            unique: false,
            index: false,
            default: None,
            on_update: None,
            comment: String::new(),
            sort_order: SORT_MODEL,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.unique = true;
        self.index = true;
        self.sort_order = SORT_PRIMARY_KEY;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn default_value(mut self, default: ColumnDefault) -> Self {
        self.default = Some(default);
        self
    }

    pub fn on_update(mut self, value: ColumnDefault) -> Self {
        self.on_update = Some(value);
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }
}

/// Reusable groups of standard columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSet {
    /// Snowflake `id` primary key plus `deleted_at`.
    SoftDelete,
    /// `created_at` and `updated_at`.
    Timestamps,
    /// `created_by` and `updated_by`.
    UserAudit,
}

impl FieldSet {
    pub fn columns(&self) -> Vec<ColumnDef> {
        match self {
            Self::SoftDelete => vec![
                ColumnDef::new("id", ColumnType::BigInt)
                    .primary_key()
                    .default_value(ColumnDefault::Snowflake)
                    .comment("Snowflake primary key"),
                ColumnDef::new("deleted_at", ColumnType::DateTime)
                    .nullable()
                    .comment("Deletion time; null while the row is live")
                    .sort_order(SORT_SOFT_DELETE),
            ],
            Self::Timestamps => vec![
                ColumnDef::new("created_at", ColumnType::DateTime)
                    .default_value(ColumnDefault::Now)
                    .comment("Creation time")
                    .sort_order(SORT_TIMESTAMPS),
                ColumnDef::new("updated_at", ColumnType::DateTime)
                    .nullable()
                    .on_update(ColumnDefault::Now)
                    .comment("Last update time")
                    .sort_order(SORT_TIMESTAMPS),
            ],
            Self::UserAudit => vec![
                ColumnDef::new("created_by", ColumnType::BigInt)
                    .comment("Creator")
                    .sort_order(SORT_USER_AUDIT),
                ColumnDef::new("updated_by", ColumnType::BigInt)
                    .nullable()
                    .comment("Last modifier")
                    .sort_order(SORT_USER_AUDIT),
            ],
        }
    }
}

/// Capability flags derived from the attached field sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub soft_delete: bool,
    pub timestamps: bool,
    pub user_audit: bool,
}

impl Capabilities {
    fn from_field_sets(field_sets: &[FieldSet]) -> Self {
        Self {
            soft_delete: field_sets.contains(&FieldSet::SoftDelete),
            timestamps: field_sets.contains(&FieldSet::Timestamps),
            user_audit: field_sets.contains(&FieldSet::UserAudit),
        }
    }
}

/// Shared marker trait of every persistable model.
///
/// ```ignore
/// struct SysUser;
///
/// impl Model for SysUser {
///     fn comment() -> &'static str {
///         "System users"
///     }
///
///     fn columns() -> Vec<ColumnDef> {
///         vec![ColumnDef::new("username", ColumnType::VarChar { length: 50 }).unique()]
///     }
/// }
///
/// assert_eq!(SysUser::table_name(), "sys_user");
/// ```
pub trait Model: 'static {
    /// Defaults to the snake_case form of the type name.
    fn table_name() -> String {
        snake_case(short_type_name(std::any::type_name::<Self>()))
    }

    fn comment() -> &'static str {
        ""
    }

    /// Columns declared by the model itself, in declaration order.
    fn columns() -> Vec<ColumnDef>;

    /// Defaults to soft delete plus timestamps.
    fn field_sets() -> &'static [FieldSet] {
        &[FieldSet::SoftDelete, FieldSet::Timestamps]
    }

    fn descriptor() -> ModelDescriptor
    where
        Self: Sized,
    {
        ModelDescriptor::of::<Self>()
    }
}

/// Flattened description of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub table_name: String,
    #[serde(skip)]
    pub type_id: TypeId,
    pub type_name: &'static str,
    /// Module path of the source that contributed the model.
    pub source_module: String,
    pub comment: String,
    /// Ordered by sort order; ties keep declaration order.
    pub columns: Vec<ColumnDef>,
    pub field_sets: Vec<FieldSet>,
    pub capabilities: Capabilities,
}

impl ModelDescriptor {
    pub fn of<M: Model>() -> Self {
        let type_name = std::any::type_name::<M>();
        let field_sets = M::field_sets().to_vec();

        let mut columns = M::columns();
        for field_set in &field_sets {
            for column in field_set.columns() {
                if !columns.iter().any(|c| c.name == column.name) {
                    columns.push(column);
                }
            }
        }
        columns.sort_by_key(|c| c.sort_order);

        Self {
            table_name: M::table_name(),
            type_id: TypeId::of::<M>(),
            type_name,
            source_module: module_of(type_name).to_string(),
            comment: M::comment().to_string(),
            columns,
            capabilities: Capabilities::from_field_sets(&field_sets),
            field_sets,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Vec<&ColumnDef> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    pub fn has_timestamps(&self) -> bool {
        self.capabilities.timestamps
    }

    pub fn is_soft_deletable(&self) -> bool {
        self.capabilities.soft_delete
    }
}

/// `SysUserRole` becomes `sys_user_role`: an underscore goes before every
/// uppercase letter except a leading one.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_uppercase() && !out.is_empty() {
            out.push('_');
        }
        out.extend(c.to_lowercase());
    }
    out
}

/// `app::models::SysUser<T>` -> `SysUser`
fn short_type_name(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}

/// `app::models::SysUser` -> `app::models`
fn module_of(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit_once("::").map(|(module, _)| module).unwrap_or("")
}
