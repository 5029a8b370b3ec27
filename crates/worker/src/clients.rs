//! Edits to client records, which are stored as JSON documents. Every
//! function here runs inside a serialized subject update.

use anyhow::{anyhow, bail};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

fn documents_mut(client: &mut Value) -> anyhow::Result<&mut Vec<Value>> {
    client
        .get_mut("documents")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| anyhow!("client record has no documents"))
}

fn document_mut<'a>(
    client: &'a mut Value,
    document_id: &str,
) -> anyhow::Result<&'a mut Map<String, Value>> {
    documents_mut(client)?
        .iter_mut()
        .filter_map(Value::as_object_mut)
        .find(|d| d.get("id").and_then(Value::as_str) == Some(document_id))
        .ok_or_else(|| anyhow!("document {document_id} not found on client"))
}

pub fn mark_document_processing(
    client: &mut Value,
    document_id: &str,
    at: DateTime<Utc>,
) -> anyhow::Result<()> {
    let doc = document_mut(client, document_id)?;
    doc.insert("processing_status".into(), json!("processing"));
    doc.insert("processing_started_at".into(), json!(at.to_rfc3339()));
    doc.remove("processing_error");
    Ok(())
}

pub fn mark_document_failed(
    client: &mut Value,
    document_id: &str,
    error: &str,
    at: DateTime<Utc>,
) -> anyhow::Result<()> {
    let doc = document_mut(client, document_id)?;
    doc.insert("processing_status".into(), json!("failed"));
    doc.insert("document_status".into(), json!("processing_failed"));
    doc.insert("processing_error".into(), json!(error));
    doc.insert("processed_at".into(), json!(at.to_rfc3339()));
    Ok(())
}

/// Store the extraction result on the document and append any creditors it
/// found to the client's final creditor list.
pub fn apply_ai_result(
    client: &mut Value,
    document_id: &str,
    result: &Value,
    at: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let document_status = result
        .get("document_status")
        .and_then(Value::as_str)
        .unwrap_or("processed")
        .to_string();

    {
        let doc = document_mut(client, document_id)?;
        doc.insert("processing_status".into(), json!("completed"));
        doc.insert("document_status".into(), json!(document_status));
        if let Some(data) = result.get("extracted_data") {
            doc.insert("extracted_data".into(), data.clone());
        }
        doc.insert("processed_at".into(), json!(at.to_rfc3339()));
        doc.remove("processing_error");
    }

    let creditors: Vec<Value> = match result.get("creditors") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => bail!("creditors must be an array"),
    };
    if creditors.is_empty() {
        return Ok(0);
    }

    let obj = client
        .as_object_mut()
        .ok_or_else(|| anyhow!("client record is not an object"))?;
    let list = obj
        .entry("final_creditor_list")
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .ok_or_else(|| anyhow!("final_creditor_list is not an array"))?;

    let added = creditors.len();
    for mut creditor in creditors {
        if let Some(c) = creditor.as_object_mut() {
            c.insert("source_document_id".into(), json!(document_id));
        }
        list.push(creditor);
    }
    Ok(added)
}

pub fn record_webhook_event(
    client: &mut Value,
    kind: &str,
    body: &Value,
    at: DateTime<Utc>,
) -> anyhow::Result<()> {
    let obj = client
        .as_object_mut()
        .ok_or_else(|| anyhow!("client record is not an object"))?;
    obj.entry("webhook_events")
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .ok_or_else(|| anyhow!("webhook_events is not an array"))?
        .push(json!({ "type": kind, "body": body, "received_at": at.to_rfc3339() }));
    Ok(())
}
