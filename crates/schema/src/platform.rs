//! The workflow-automation platform schema.
//!
//! Users own credentials, workflows, runs, service requests and API keys.
//! Workflows and credentials meet through the `WorkflowCredential` join entity.

use crate::model::{Entity, Field, FieldDefault, ReferentialAction, Relation, ScalarKind};
use crate::{SchemaError, SchemaRegistry, Value};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of an installed workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub const VARIANTS: &'static [&'static str] = &["IDLE", "RUNNING", "COMPLETED", "FAILED", "CANCELLED"];
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle      => write!(f, "IDLE"),
            Self::Running   => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed    => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE"      => Ok(Self::Idle),
            "RUNNING"   => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED"    => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other       => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// Status of a single workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Started,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const VARIANTS: &'static [&'static str] = &["STARTED", "RUNNING", "COMPLETED", "FAILED", "CANCELLED"];
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started   => write!(f, "STARTED"),
            Self::Running   => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed    => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED"   => Ok(Self::Started),
            "RUNNING"   => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED"    => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other       => Err(format!("unknown run status: {other}")),
        }
    }
}

pub const CREDENTIAL_TYPES: &[&str] = &["OAUTH", "API_KEY", "BASIC_AUTH"];
pub const PROVIDERS: &[&str] = &["GOOGLE", "MICROSOFT", "SLACK", "FIRECRAWL", "HUBSPOT", "CUSTOM"];
pub const REQUEST_PRIORITIES: &[&str] = &["LOW", "MEDIUM", "HIGH", "URGENT"];
pub const REQUEST_STATUSES: &[&str] = &[
    "SUBMITTED",
    "REVIEWED",
    "MEETING_SCHEDULED",
    "PROPOSAL_SENT",
    "APPROVED",
    "IN_PROGRESS",
    "COMPLETED",
    "CANCELLED",
];

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn id() -> Field {
    Field::new("id", ScalarKind::String).default_to(FieldDefault::Uuid)
}

fn string(name: &str) -> Field {
    Field::new(name, ScalarKind::String)
}

fn int(name: &str) -> Field {
    Field::new(name, ScalarKind::Int)
}

fn boolean(name: &str, default: bool) -> Field {
    Field::new(name, ScalarKind::Boolean).default_to(FieldDefault::Value(Value::Boolean(default)))
}

fn json(name: &str) -> Field {
    Field::new(name, ScalarKind::Json).optional()
}

fn timestamp(name: &str) -> Field {
    Field::new(name, ScalarKind::DateTime)
}

fn enumeration(name: &str, enum_name: &str) -> Field {
    Field::new(name, ScalarKind::Enum { name: enum_name.to_owned() })
}

fn enum_default(name: &str, enum_name: &str, default: &str) -> Field {
    enumeration(name, enum_name).default_to(FieldDefault::Value(Value::Enum(default.to_owned())))
}

fn created_at() -> Field {
    timestamp("createdAt").default_to(FieldDefault::Now)
}

fn updated_at() -> Field {
    timestamp("updatedAt").updated_at()
}

fn owner(name: &str, target: &str, field: &str) -> Relation {
    Relation::belongs_to(name, target, &[field], &["id"])
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

fn user() -> Entity {
    Entity::new("User")
        .with_field(id())
        .with_field(string("clerkId"))
        .with_field(string("email"))
        .with_field(string("name").optional())
        .with_field(string("imageUrl").optional())
        .with_field(created_at())
        .with_field(updated_at())
        .with_relation(Relation::has_many("credentials", "Credential", "user"))
        .with_relation(Relation::has_many("workflows", "Workflow", "user"))
        .with_relation(Relation::has_many("workflowRuns", "WorkflowRun", "user"))
        .with_relation(Relation::has_many("serviceRequests", "ServiceRequest", "user"))
        .with_relation(Relation::has_many("apiKeys", "ApiKey", "user"))
        .with_relation(Relation::has_one("branding", "ClientBranding", "user"))
        .with_unique(&["clerkId"])
        .with_unique(&["email"])
}

fn credential() -> Entity {
    Entity::new("Credential")
        .with_field(id())
        .with_field(string("userId"))
        .with_field(string("name"))
        .with_field(enumeration("type", "CredentialType"))
        .with_field(enumeration("provider", "Provider"))
        .with_field(string("secret").optional())
        .with_field(json("config"))
        .with_field(created_at())
        .with_field(updated_at())
        .with_relation(owner("user", "User", "userId").on_delete(ReferentialAction::Cascade))
        .with_relation(Relation::has_many("workflows", "WorkflowCredential", "credential"))
        .with_unique(&["userId", "name"])
}

fn workflow() -> Entity {
    Entity::new("Workflow")
        .with_field(id())
        .with_field(string("userId"))
        .with_field(string("templateId").optional())
        .with_field(string("name"))
        .with_field(string("description").optional())
        .with_field(boolean("available", true))
        .with_field(enum_default("status", "WorkflowStatus", "IDLE"))
        .with_field(boolean("canBeScheduled", false))
        .with_field(string("cronExpressions").list())
        .with_field(string("timezone").default_to(FieldDefault::Value(Value::from("UTC"))))
        .with_field(json("input"))
        .with_field(json("fields"))
        .with_field(json("config"))
        .with_field(string("eventName"))
        .with_field(enumeration("requiredProviders", "Provider").list())
        .with_field(json("requiredScopes"))
        .with_field(string("version").optional())
        .with_field(timestamp("nextRunAt").optional())
        .with_field(timestamp("lastRunAt").optional())
        .with_field(created_at())
        .with_field(updated_at())
        .with_relation(owner("user", "User", "userId").on_delete(ReferentialAction::Cascade))
        .with_relation(owner("template", "WorkflowTemplate", "templateId"))
        .with_relation(Relation::has_many("credentials", "WorkflowCredential", "workflow"))
        .with_relation(Relation::has_many("runs", "WorkflowRun", "workflow"))
        .with_relation(Relation::has_many("metrics", "AutomationMetrics", "workflow"))
}

fn workflow_credential() -> Entity {
    Entity::new("WorkflowCredential")
        .with_field(string("workflowId"))
        .with_field(string("credentialId"))
        .with_field(created_at())
        .with_relation(owner("workflow", "Workflow", "workflowId").on_delete(ReferentialAction::Cascade))
        .with_relation(owner("credential", "Credential", "credentialId").on_delete(ReferentialAction::Cascade))
        .with_identity(&["workflowId", "credentialId"])
}

fn workflow_run() -> Entity {
    Entity::new("WorkflowRun")
        .with_field(id())
        .with_field(string("workflowId"))
        .with_field(string("userId"))
        .with_field(string("inngestRunId"))
        .with_field(string("idempotencyKey").optional())
        .with_field(enum_default("status", "RunStatus", "STARTED"))
        .with_field(json("input"))
        .with_field(json("output"))
        .with_field(string("error").optional())
        .with_field(timestamp("startedAt").default_to(FieldDefault::Now))
        .with_field(timestamp("completedAt").optional())
        .with_field(int("duration").optional())
        // Run history outlives nothing: a workflow or user with runs cannot be deleted.
        .with_relation(owner("workflow", "Workflow", "workflowId"))
        .with_relation(owner("user", "User", "userId"))
        .with_unique(&["inngestRunId"])
        .with_unique(&["idempotencyKey"])
}

fn workflow_template() -> Entity {
    Entity::new("WorkflowTemplate")
        .with_field(id())
        .with_field(string("name"))
        .with_field(string("description").optional())
        .with_field(string("eventName"))
        .with_field(boolean("canBeScheduled", false))
        .with_field(enumeration("requiredProviders", "Provider").list())
        .with_field(json("requiredScopes"))
        .with_field(json("fields"))
        .with_field(string("version").default_to(FieldDefault::Value(Value::from("1.0.0"))))
        .with_field(string("tags").list())
        .with_field(string("category").optional())
        .with_field(boolean("featured", false))
        .with_field(created_at())
        .with_field(updated_at())
        .with_relation(Relation::has_many("workflows", "Workflow", "template"))
}

fn client_branding() -> Entity {
    Entity::new("ClientBranding")
        .with_field(id())
        .with_field(string("userId"))
        .with_field(string("companyName"))
        .with_field(string("logoUrl").optional())
        .with_field(string("primaryColor").optional())
        .with_field(string("secondaryColor").optional())
        .with_field(created_at())
        .with_field(updated_at())
        .with_relation(owner("user", "User", "userId").on_delete(ReferentialAction::Cascade))
        .with_unique(&["userId"])
}

fn service_request() -> Entity {
    Entity::new("ServiceRequest")
        .with_field(id())
        .with_field(string("userId"))
        .with_field(string("title"))
        .with_field(string("description"))
        .with_field(string("businessProcess"))
        .with_field(string("desiredOutcome"))
        .with_field(enum_default("priority", "RequestPriority", "MEDIUM"))
        .with_field(enum_default("status", "RequestStatus", "SUBMITTED"))
        .with_field(timestamp("preferredMeetingDate").optional())
        .with_field(string("availabilityNotes").optional())
        .with_field(Field::new("estimatedHours", ScalarKind::Float).optional())
        .with_field(Field::new("quotedPrice", ScalarKind::Decimal).optional())
        .with_field(created_at())
        .with_field(updated_at())
        .with_relation(owner("user", "User", "userId").on_delete(ReferentialAction::Cascade))
}

fn automation_metrics() -> Entity {
    let counter = |name: &str| int(name).default_to(FieldDefault::Value(Value::Int(0)));
    Entity::new("AutomationMetrics")
        .with_field(id())
        .with_field(string("workflowId"))
        .with_field(timestamp("date"))
        .with_field(counter("runsCount"))
        .with_field(counter("successCount"))
        .with_field(counter("failureCount"))
        .with_field(Field::new("avgDuration", ScalarKind::Float).optional())
        .with_field(int("timeSavedMinutes").optional())
        .with_field(int("errorsPrevented").optional())
        .with_field(Field::new("costSavings", ScalarKind::Decimal).optional())
        .with_field(created_at())
        .with_relation(owner("workflow", "Workflow", "workflowId").on_delete(ReferentialAction::Cascade))
        .with_unique(&["workflowId", "date"])
}

fn api_key() -> Entity {
    Entity::new("ApiKey")
        .with_field(id())
        .with_field(string("userId"))
        .with_field(string("name"))
        .with_field(string("key"))
        .with_field(string("keyHash"))
        .with_field(timestamp("lastUsedAt").optional())
        .with_field(timestamp("expiresAt").optional())
        .with_field(boolean("isActive", true))
        .with_field(created_at())
        .with_field(updated_at())
        .with_relation(owner("user", "User", "userId").on_delete(ReferentialAction::Cascade))
        .with_unique(&["key"])
        .with_unique(&["keyHash"])
}

/// Build the registry for the whole platform schema.
pub fn platform_registry() -> Result<SchemaRegistry, SchemaError> {
    SchemaRegistry::builder()
        .enumeration("CredentialType", CREDENTIAL_TYPES)
        .enumeration("Provider", PROVIDERS)
        .enumeration("WorkflowStatus", WorkflowStatus::VARIANTS)
        .enumeration("RunStatus", RunStatus::VARIANTS)
        .enumeration("RequestPriority", REQUEST_PRIORITIES)
        .enumeration("RequestStatus", REQUEST_STATUSES)
        .entity(user())
        .entity(credential())
        .entity(workflow())
        .entity(workflow_credential())
        .entity(workflow_run())
        .entity(workflow_template())
        .entity(client_branding())
        .entity(service_request())
        .entity(automation_metrics())
        .entity(api_key())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Cardinality;

    #[test]
    fn platform_schema_is_valid() {
        let registry = platform_registry().expect("platform schema should validate");
        assert_eq!(registry.entities().count(), 10);
    }

    #[test]
    fn join_entity_is_keyed_by_both_foreign_keys() {
        let registry = platform_registry().unwrap();
        let join = registry.entity("WorkflowCredential").unwrap();
        assert_eq!(join.identity.name, "workflowId_credentialId");
        assert!(join.relations.iter().all(|r| r.cardinality == Cardinality::One && r.is_owned()));
    }

    #[test]
    fn branding_is_an_optional_one_to_one() {
        let registry = platform_registry().unwrap();
        let user = registry.entity("User").unwrap();
        let branding = user.relation("branding").unwrap();
        assert_eq!(branding.cardinality, Cardinality::One);
        assert!(registry.is_optional(user, branding));
    }

    #[test]
    fn optional_template_link_is_cleared_on_delete() {
        let registry = platform_registry().unwrap();
        let workflow = registry.entity("Workflow").unwrap();
        assert_eq!(
            workflow.relation("template").unwrap().on_delete_action(),
            Some(ReferentialAction::SetNull)
        );
        assert_eq!(
            workflow.relation("user").unwrap().on_delete_action(),
            Some(ReferentialAction::Cascade)
        );
    }

    #[test]
    fn status_enums_round_trip_through_strings() {
        for variant in RunStatus::VARIANTS {
            let parsed: RunStatus = variant.parse().unwrap();
            assert_eq!(parsed.to_string(), *variant);
        }
        assert!("PAUSED".parse::<WorkflowStatus>().is_err());
    }
}
