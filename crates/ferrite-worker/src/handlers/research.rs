use std::sync::Arc;

use serde_json::{json, Value};

use ferrite_types::Run;

use crate::handlers::{HandlerError, HeartbeatFn, TaskRunner};
use crate::task_context::TaskContext;
use crate::tools::{build_catalog_from_settings, ToolRuntime};

const DEFAULT_MAX_SOURCES: usize = 2;
const MAX_SOURCES_CAP: usize = 5;
const QUOTE_MAX_CHARS: usize = 200;

impl TaskRunner {
    /// search → fetch per source → extract → dedupe_rank → write_report.
    pub(crate) async fn handle_research_report(
        &self,
        run: &Run,
        ctx: &mut TaskContext,
        heartbeat: &dyn HeartbeatFn,
    ) -> Result<(), HandlerError> {
        let settings = self.run_settings(run);
        let catalog = Arc::new(build_catalog_from_settings(&settings));
        let runtime = ToolRuntime::new(catalog.clone());
        let outcome = self
            .research_with_runtime(ctx, heartbeat, &runtime)
            .await;
        catalog.close_providers().await;
        outcome
    }

    /// Core of the research task against an injected tool runtime.
    ///
    /// Individual fetch failures are survivable: as long as one source
    /// yields text and a report is written, the envelope flips back to ok
    /// while the failed steps stay on record.
    pub(crate) async fn research_with_runtime(
        &self,
        ctx: &mut TaskContext,
        heartbeat: &dyn HeartbeatFn,
        runtime: &ToolRuntime,
    ) -> Result<(), HandlerError> {
        let query = ctx
            .input
            .get("query")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| ctx.title.clone())
            .unwrap_or_else(|| "调研".to_string());
        let max_sources = ctx
            .input
            .get("max_sources")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_SOURCES)
            .clamp(1, MAX_SOURCES_CAP);

        let search = match runtime
            .invoke(
                ctx,
                "web.search",
                json!({"query": query, "max_results": max_sources}),
                Some(self.llm.as_ref()),
            )
            .await
        {
            Ok(value) => value,
            Err(_) => return Err(HandlerError::Task),
        };
        heartbeat.beat().await?;

        let sources: Vec<Value> = search
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .take(max_sources)
            .collect();

        // One fetch per source; failures recorded but tolerated
        let mut fetched: Vec<Option<Value>> = Vec::with_capacity(sources.len());
        let mut fetch_ok = 0usize;
        for source in &sources {
            let url = source.get("url").and_then(|v| v.as_str()).unwrap_or("");
            match runtime
                .invoke(ctx, "web.fetch", json!({"url": url}), None)
                .await
            {
                Ok(value) => {
                    fetch_ok += 1;
                    fetched.push(Some(value));
                }
                Err(_) => {
                    fetched.push(None);
                }
            }
            heartbeat.beat().await?;
        }

        // extract: pull one short quote per fetched source
        let mut step = ctx.step("extract");
        let mut evidence: Vec<Value> = Vec::new();
        for (index, fetch) in fetched.iter().enumerate() {
            let Some(fetch) = fetch else { continue };
            let text = fetch.get("text").and_then(|v| v.as_str()).unwrap_or("");
            let quote: String = text.chars().take(QUOTE_MAX_CHARS).collect();
            if quote.trim().is_empty() {
                continue;
            }
            let source_url = sources[index]
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            evidence.push(json!({
                "quote": quote.trim(),
                "source_url": source_url,
                "source_index": index,
            }));
        }
        step.meta
            .insert("evidence_count".to_string(), json!(evidence.len()));
        ctx.complete_step(step);

        // dedupe_rank: drop duplicate urls, keep rank order
        let mut step = ctx.step("dedupe_rank");
        let mut seen_urls = std::collections::HashSet::new();
        let deduped: Vec<Value> = sources
            .iter()
            .filter(|s| {
                let url = s.get("url").and_then(|v| v.as_str()).unwrap_or("");
                seen_urls.insert(url.to_string())
            })
            .cloned()
            .collect();
        step.meta.insert("before".to_string(), json!(sources.len()));
        step.meta.insert("after".to_string(), json!(deduped.len()));
        ctx.complete_step(step);

        // write_report
        let mut step = ctx.step("write_report");
        let mut report = format!("# 调研报告：{query}\n\n");
        if let Some(summary) = search.get("summary").and_then(|v| v.as_str()) {
            report.push_str(&format!("{summary}\n\n"));
        }
        report.push_str("## 要点\n\n");
        if evidence.is_empty() {
            report.push_str("- (no extractable evidence)\n");
        }
        for item in &evidence {
            report.push_str(&format!(
                "- {} (source {})\n",
                item["quote"].as_str().unwrap_or(""),
                item["source_index"]
            ));
        }
        report.push_str("\n## 来源\n\n");
        for source in &deduped {
            report.push_str(&format!(
                "- [{}]({})\n",
                source.get("title").and_then(|v| v.as_str()).unwrap_or("untitled"),
                source.get("url").and_then(|v| v.as_str()).unwrap_or("")
            ));
        }
        step.meta
            .insert("report_chars".to_string(), json!(report.chars().count()));
        ctx.complete_step(step);

        ctx.artifacts.insert(
            "report".to_string(),
            json!({"text": report, "format": "markdown"}),
        );
        ctx.artifacts.insert("sources".to_string(), json!(deduped));
        ctx.artifacts.insert("evidence".to_string(), json!(evidence));
        ctx.result
            .insert("source_count".to_string(), json!(deduped.len()));
        ctx.result
            .insert("evidence_count".to_string(), json!(evidence.len()));

        // Canonical partial success: a report was produced and at least one
        // fetch worked (or nothing needed fetching).
        if !ctx.ok() && (fetch_ok >= 1 || sources.is_empty()) {
            ctx.set_ok(true);
            ctx.clear_error();
        }
        if !ctx.ok() {
            return Err(HandlerError::Task);
        }
        Ok(())
    }
}
