use crate::error::{NormalizationError, Result};
use crate::identity::OrgScope;
use crate::materializer::{self, PhysicalTable};
use crate::schema::NormalizationTemplate;
use crate::store::{self, Store};
use chrono::Utc;
use log::{error, info};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    Draft,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Approve,
    Reject,
}

impl TemplateStatus {
    /// The complete transition table. `None` means the move is illegal.
    pub fn apply(self, action: LifecycleAction) -> Option<TemplateStatus> {
        match (self, action) {
            (TemplateStatus::Draft, LifecycleAction::Approve) => Some(TemplateStatus::Approved),
            (TemplateStatus::Draft, LifecycleAction::Reject) => Some(TemplateStatus::Rejected),
            (TemplateStatus::Approved, _) | (TemplateStatus::Rejected, _) => None,
        }
    }

    pub fn transition(self, template_id: Uuid, action: LifecycleAction) -> Result<TemplateStatus> {
        self.apply(action)
            .ok_or_else(|| invalid_transition(template_id, self, action))
    }

    /// Draft and approved templates block new generations for the same document.
    pub fn is_active(self) -> bool {
        matches!(self, TemplateStatus::Draft | TemplateStatus::Approved)
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TemplateStatus::Draft)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateStatus::Draft => "draft",
            TemplateStatus::Approved => "approved",
            TemplateStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TemplateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateStatus {
    type Err = NormalizationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(TemplateStatus::Draft),
            "approved" => Ok(TemplateStatus::Approved),
            "rejected" => Ok(TemplateStatus::Rejected),
            other => Err(NormalizationError::ValidationError(format!(
                "unknown template status: {}",
                other
            ))),
        }
    }
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Approve => "approve",
            LifecycleAction::Reject => "reject",
        }
    }
}

fn invalid_transition(id: Uuid, from: TemplateStatus, action: LifecycleAction) -> NormalizationError {
    NormalizationError::InvalidTransition {
        template_id: id.to_string(),
        from: from.as_str().to_string(),
        action: action.as_str().to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub template: NormalizationTemplate,
    pub table: PhysicalTable,
}

/// Moves `template_id` along `action` with a compare-and-swap on the stored status.
fn transition_in(
    conn: &Connection,
    template_id: Uuid,
    action: LifecycleAction,
) -> Result<NormalizationTemplate> {
    let template = store::get_template(conn, template_id)?;
    let next = template.status.transition(template_id, action)?;
    let now = Utc::now();

    if !store::transition_status(conn, template_id, template.status, next, now)? {
        let current = store::get_template(conn, template_id)?;
        return Err(invalid_transition(template_id, current.status, action));
    }

    Ok(NormalizationTemplate {
        status: next,
        updated_at: now,
        ..template
    })
}

/// Approval and materialization share one transaction: if the table cannot be created
/// the status update rolls back with it and the template stays a draft.
pub fn approve_in(conn: &Connection, draft_id: Uuid, org: &OrgScope) -> Result<ApprovalOutcome> {
    let template = transition_in(conn, draft_id, LifecycleAction::Approve)?;
    let table = materializer::materialize_in(conn, &template, org)?;
    Ok(ApprovalOutcome { template, table })
}

pub fn reject_in(conn: &Connection, draft_id: Uuid) -> Result<NormalizationTemplate> {
    transition_in(conn, draft_id, LifecycleAction::Reject)
}

#[derive(Clone)]
pub struct DraftLifecycle {
    store: Store,
}

impl DraftLifecycle {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn approve(&self, draft_id: Uuid, org: &OrgScope) -> Result<ApprovalOutcome> {
        let org = org.clone();
        let result = self
            .store
            .transaction(move |conn| approve_in(conn, draft_id, &org))
            .await;

        match &result {
            Ok(outcome) => info!(
                "Approved template {} (v{}) as table {}",
                draft_id, outcome.template.version, outcome.table.physical_name
            ),
            Err(e @ NormalizationError::TransactionFailure { .. }) => {
                error!("Approval of draft {} rolled back: {}", draft_id, e)
            }
            Err(_) => {}
        }
        result
    }

    /// Rejection is a normal outcome; the document stays available for a new generation.
    pub async fn reject(&self, draft_id: Uuid) -> Result<NormalizationTemplate> {
        let template = self
            .store
            .transaction(move |conn| reject_in(conn, draft_id))
            .await?;
        info!(
            "Rejected template {} (v{}) for document {}",
            template.id, template.version, template.document_id
        );
        Ok(template)
    }

    pub async fn template(&self, id: Uuid) -> Result<NormalizationTemplate> {
        self.store.call(move |conn| store::get_template(conn, id)).await
    }

    /// All versions for a document, oldest first.
    pub async fn versions(&self, document_id: Uuid) -> Result<Vec<NormalizationTemplate>> {
        self.store
            .call(move |conn| store::list_templates(conn, document_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{SourceType, TextEncoding};
    use crate::schema::{Document, LogicalType, TemplateColumn};

    #[test]
    fn test_transition_table() {
        use LifecycleAction::*;
        use TemplateStatus::*;

        assert_eq!(Draft.apply(Approve), Some(Approved));
        assert_eq!(Draft.apply(Reject), Some(Rejected));
        for from in [Approved, Rejected] {
            for action in [Approve, Reject] {
                assert_eq!(from.apply(action), None);
            }
        }
        assert!(Draft.is_active() && Approved.is_active() && !Rejected.is_active());
        assert!(!Draft.is_terminal() && Approved.is_terminal());
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [TemplateStatus::Draft, TemplateStatus::Approved, TemplateStatus::Rejected] {
            assert_eq!(status.as_str().parse::<TemplateStatus>().unwrap(), status);
        }
        assert!("archived".parse::<TemplateStatus>().is_err());
    }

    async fn seeded_draft(db: &Store, table_name: &str) -> NormalizationTemplate {
        let table_name = table_name.to_string();
        db.call(move |conn| {
            let doc = store::insert_document(
                conn,
                &Document {
                    id: Uuid::new_v4(),
                    content_hash: Uuid::new_v4().to_string(),
                    source_type: SourceType::Delimited,
                    file_name: None,
                    encoding: TextEncoding::Utf8,
                    delimiter: Some(';'),
                    headers: vec!["Valor".to_string()],
                    row_count: 1,
                    byte_len: 10,
                    created_at: Utc::now(),
                },
            )?;
            let template = NormalizationTemplate {
                id: Uuid::new_v4(),
                document_id: doc.id,
                table_name,
                columns: vec![TemplateColumn {
                    source_field: "Valor".to_string(),
                    target_field: "valor".to_string(),
                    logical_type: LogicalType::Decimal,
                    transform: None,
                }],
                status: TemplateStatus::Draft,
                version: 1,
                model: "stub".to_string(),
                confidence: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            store::insert_template(conn, &template)?;
            Ok(template)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_approve_then_approve_again_fails() {
        let db = Store::open_in_memory().unwrap();
        let lifecycle = DraftLifecycle::new(db.clone());
        let org = OrgScope::new("acme").unwrap();
        let draft = seeded_draft(&db, "ledger_a").await;

        let outcome = lifecycle.approve(draft.id, &org).await.unwrap();
        assert_eq!(outcome.template.status, TemplateStatus::Approved);
        assert_eq!(outcome.table.table_name, "ledger_a");

        let err = lifecycle.approve(draft.id, &org).await.unwrap_err();
        assert!(matches!(err, NormalizationError::InvalidTransition { ref from, .. } if from == "approved"));
        let err = lifecycle.reject(draft.id).await.unwrap_err();
        assert!(matches!(err, NormalizationError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_rejected_draft_cannot_be_approved() {
        let db = Store::open_in_memory().unwrap();
        let lifecycle = DraftLifecycle::new(db.clone());
        let org = OrgScope::new("acme").unwrap();
        let draft = seeded_draft(&db, "ledger_b").await;

        let rejected = lifecycle.reject(draft.id).await.unwrap();
        assert_eq!(rejected.status, TemplateStatus::Rejected);

        let err = lifecycle.approve(draft.id, &org).await.unwrap_err();
        assert!(matches!(err, NormalizationError::InvalidTransition { ref from, .. } if from == "rejected"));
        assert!(lifecycle.reject(draft.id).await.is_err());
        assert_eq!(lifecycle.template(draft.id).await.unwrap().status, TemplateStatus::Rejected);
    }

    #[tokio::test]
    async fn test_failed_materialization_keeps_draft() {
        let db = Store::open_in_memory().unwrap();
        let lifecycle = DraftLifecycle::new(db.clone());
        let org = OrgScope::new("acme").unwrap();
        let draft = seeded_draft(&db, "ledger_c").await;
        db.call(|conn| Ok(conn.execute_batch("CREATE TABLE \"org_acme__ledger_c\" (x TEXT)")?))
            .await
            .unwrap();

        let err = lifecycle.approve(draft.id, &org).await.unwrap_err();
        assert!(matches!(err, NormalizationError::TransactionFailure { .. }));
        assert_eq!(lifecycle.template(draft.id).await.unwrap().status, TemplateStatus::Draft);
    }

    #[tokio::test]
    async fn test_concurrent_approvals_materialize_once() {
        let db = Store::open_in_memory().unwrap();
        let lifecycle = DraftLifecycle::new(db.clone());
        let org = OrgScope::new("acme").unwrap();
        let draft_id = seeded_draft(&db, "ledger_d").await.id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                let org = org.clone();
                tokio::spawn(async move { lifecycle.approve(draft_id, &org).await })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(NormalizationError::InvalidTransition { .. }) => {}
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
        assert_eq!(successes, 1);

        let tables = db
            .call(|conn| store::list_physical_tables(conn, "acme"))
            .await
            .unwrap();
        assert_eq!(tables.len(), 1);
    }
}
