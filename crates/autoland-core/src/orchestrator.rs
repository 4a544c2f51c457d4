//! The orchestrator: discovery, validation, dispatch, and aggregation.
//!
//! One cooperative loop alternates between polling the tracker for
//! waiting landing requests and draining the result queue. Discovery
//! writes a Request plus one Patchset per target branch; dispatch turns
//! queued patchsets into `apply` jobs on the bus, gated by the branch
//! concurrency threshold and the tree-status endpoint; result messages
//! are joined in a per-request barrier that produces the terminal status
//! and the summary comment. The orchestrator is the only writer of
//! Request status.

use std::collections::BTreeSet;
use std::time::Instant;

use anyhow::{Context, Result};
use autoland_bugzilla::{Tracker, WaitingRequest, parse_tracker_time};
use autoland_bus::Bus;
use autoland_directory::Directory;
use autoland_types::{
    Branch, FlagResult, JobMessage, Patch, PatchsetJob, PatchsetStatus, RequestStatus,
    ResultAction, ResultKind, ResultMessage, join_ids, parse_branches,
};
use chrono::Utc;

use crate::outbox;
use crate::report::Reporter;
use crate::services::Services;
use crate::treestatus;

/// The routing key this process consumes (results and completions).
pub const RESULT_ROUTING_KEY: &str = "db";
/// The routing key apply jobs are published under.
pub const JOB_ROUTING_KEY: &str = "hgpusher";

/// Run the orchestrator loop: poll, dispatch, drain, sweep. Never returns
/// under normal operation.
pub fn run(services: &Services, reporter: &mut dyn Reporter) -> Result<()> {
    let config = &services.config;
    services
        .bus
        .bind(&config.bus.orchestrator_queue, RESULT_ROUTING_KEY)?;
    reporter.info("orchestrator started");

    loop {
        if let Err(e) = discover(services, reporter) {
            reporter.error(&format!("discovery failed: {e:#}"));
        }
        let next_poll = Instant::now() + config.orchestrator.poll_interval;

        sweep_outbox(services, reporter);

        while Instant::now() < next_poll {
            if let Err(e) = dispatch_pending(services, reporter) {
                reporter.error(&format!("dispatch failed: {e:#}"));
            }
            match drain_results(services, reporter) {
                Ok(0) => std::thread::sleep(std::time::Duration::from_secs(5)),
                Ok(_) => {}
                Err(e) => reporter.error(&format!("drain failed: {e:#}")),
            }
        }
    }
}

pub fn sweep_outbox(services: &Services, reporter: &mut dyn Reporter) {
    if let Err(e) = outbox::sweep(
        &services.store,
        services.tracker.as_ref(),
        &services.config.orchestrator.failed_comments_log,
        services.config.orchestrator.comment_attempts,
        reporter,
    ) {
        reporter.error(&format!("comment sweep failed: {e:#}"));
    }
}

fn post_comment(services: &Services, bug_id: u64, body: &str, reporter: &mut dyn Reporter) {
    if let Err(e) = outbox::post_or_queue(
        &services.store,
        services.tracker.as_ref(),
        &services.config.orchestrator.failed_comments_log,
        bug_id,
        body,
        reporter,
    ) {
        reporter.error(&format!("comment handling failed for bug {bug_id}: {e:#}"));
    }
}

// -- discovery --------------------------------------------------------------

/// Poll the tracker for waiting requests and persist + validate each new
/// one. Already-processed (bug, source-timestamp) pairs are skipped.
pub fn discover(services: &Services, reporter: &mut dyn Reporter) -> Result<()> {
    let waiting = match services.tracker.waiting_requests() {
        Ok(waiting) => waiting,
        Err(e) => {
            reporter.warn(&format!("cannot retrieve waiting requests: {e}"));
            return Ok(());
        }
    };

    for request in waiting {
        if let Err(e) = discover_one(services, &request, reporter) {
            reporter.error(&format!(
                "handling waiting request for bug {} failed: {e:#}",
                request.bug_id
            ));
        }
    }
    Ok(())
}

fn discover_one(
    services: &Services,
    waiting: &WaitingRequest,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let store = &services.store;
    let bug_id = waiting.bug_id;

    let status_when = match parse_tracker_time(&waiting.status_when) {
        Ok(t) => t,
        Err(e) => {
            reporter.warn(&format!("bug {bug_id}: {e}"));
            return Ok(());
        }
    };

    if store.request_processed(bug_id, &status_when)? {
        return Ok(());
    }

    let branches = parse_branches(&waiting.branches);
    let patch_ids = waiting.waiting_patch_ids();

    let Some(request_id) =
        store.insert_request(bug_id, &branches, &patch_ids, &status_when, waiting.try_syntax.as_deref())?
    else {
        // lost a race with ourselves; treat like already processed
        return Ok(());
    };

    match validate(services, waiting, &branches, &patch_ids, reporter) {
        Ok(()) => {
            store.set_request_status(request_id, RequestStatus::Verified)?;
            let author = waiting.landing_user().unwrap_or_default().to_string();
            for branch in &branches {
                store.insert_patchset(
                    request_id,
                    bug_id,
                    branch,
                    &patch_ids,
                    &status_when,
                    waiting.try_syntax.as_deref(),
                    branch.eq_ignore_ascii_case("try"),
                    &author,
                )?;
            }
            reporter.info(&format!(
                "bug {bug_id}: request {request_id} verified for branches {branches:?}"
            ));
            post_comment(
                services,
                bug_id,
                &format!(
                    "Autoland request for bug {bug_id} has been queued for submission.\n\
                     \tPatches: {}\n\tBranches: {}",
                    join_ids(&patch_ids),
                    branches.join(", ")
                ),
                reporter,
            );
        }
        Err(reasons) => {
            store.set_request_status(request_id, RequestStatus::NotVerified)?;
            if let Err(e) = services.tracker.remove_from_queue(&patch_ids) {
                reporter.warn(&format!("bug {bug_id}: cannot update tracker queue: {e}"));
            }
            reporter.info(&format!("bug {bug_id}: request not verified: {reasons:?}"));
            post_comment(
                services,
                bug_id,
                &format!("Autoland Failure:\n\n{}", reasons.join("\n")),
                reporter,
            );
        }
    }
    Ok(())
}

// -- validation -------------------------------------------------------------

/// Validation V(bug, branches): non-empty branch list, every branch
/// enabled, every waiting attachment a concrete patch, and every patch
/// applicable to every target branch. Any failure rejects the whole
/// request with user-readable reasons.
fn validate(
    services: &Services,
    waiting: &WaitingRequest,
    branches: &[String],
    patch_ids: &[u64],
    reporter: &mut dyn Reporter,
) -> std::result::Result<(), Vec<String>> {
    let mut reasons = Vec::new();

    if branches.is_empty() {
        return Err(vec!["Request does not specify any branches.".to_string()]);
    }

    let mut branch_rows = Vec::new();
    for name in branches {
        match services.store.branch(name) {
            Ok(Some(branch)) if branch.enabled => branch_rows.push(branch),
            Ok(Some(_)) => reasons.push(format!("Branch {name} is not enabled.")),
            Ok(None) => reasons.push(format!("Branch {name} does not exist.")),
            Err(e) => {
                reporter.error(&format!("branch lookup for {name} failed: {e:#}"));
                reasons.push(format!("Branch {name} could not be looked up."));
            }
        }
    }
    if !reasons.is_empty() {
        return Err(reasons);
    }

    if patch_ids.is_empty() {
        return Err(vec!["There are no patches to run.".to_string()]);
    }
    let patches = match services.tracker.patches(waiting.bug_id, patch_ids) {
        Ok(patches) => patches,
        Err(e) => return Err(vec![format!("Patches could not be retrieved: {e}")]),
    };

    for branch in &branch_rows {
        reasons.extend(branch_reasons(services, branch, &patches));
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(reasons)
    }
}

fn in_group(services: &Services, email: &str, group: &str) -> bool {
    // directory failures propagate as permission denied
    services.directory.in_group(email, group).unwrap_or(false)
}

/// P(patch, branch) over a whole patch list, folded into user-readable
/// rejection reasons. Empty means every patch is applicable.
fn branch_reasons(services: &Services, branch: &Branch, patches: &[Patch]) -> Vec<String> {
    // branches like try take anything
    if !branch.review_required {
        return Vec::new();
    }

    let group = match services.directory.branch_group(&branch.name) {
        Ok(group) => group,
        Err(e) => {
            return vec![format!(
                "Cannot determine required permissions for branch {}: {e}",
                branch.name
            )];
        }
    };

    let mut failed = BTreeSet::new();
    let mut pending = BTreeSet::new();
    let mut invalid = BTreeSet::new();

    for patch in patches {
        let mut reviewed = false;
        for review in &patch.reviews {
            match review.result {
                FlagResult::Granted => {
                    if in_group(services, &review.reviewer.email, &group) {
                        reviewed = true;
                    } else {
                        invalid.insert(patch.id);
                    }
                }
                FlagResult::Requested => {
                    pending.insert(patch.id);
                }
                FlagResult::Denied => {
                    failed.insert(patch.id);
                }
            }
        }
        if !reviewed && !failed.contains(&patch.id) && !invalid.contains(&patch.id) {
            pending.insert(patch.id);
        }
    }

    let ids = |set: &BTreeSet<u64>| {
        set.iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    };

    let mut reasons = Vec::new();
    if !failed.is_empty() {
        reasons.push(format!("Review failed on patch(es): {}", ids(&failed)));
    }
    if !invalid.is_empty() {
        reasons.push(format!(
            "Reviewer doesn't have correct permissions for {} on patch(es): {}",
            branch.name,
            ids(&invalid)
        ));
    }
    if !pending.is_empty() {
        reasons.push(format!(
            "Review not yet given on patch(es): {}",
            ids(&pending)
        ));
    }
    if !reasons.is_empty() {
        return reasons;
    }

    if branch.approval_required {
        reasons.extend(approval_reasons(services, branch, patches, &group));
    }
    reasons
}

fn approval_reasons(
    services: &Services,
    branch: &Branch,
    patches: &[Patch],
    group: &str,
) -> Vec<String> {
    let mut failed = BTreeSet::new();
    let mut pending = BTreeSet::new();
    let mut invalid = BTreeSet::new();

    for patch in patches {
        let mut approved = false;
        let mut tagged = false;
        for approval in &patch.approvals {
            if !approval
                .branch
                .trim()
                .eq_ignore_ascii_case(&branch.name)
            {
                continue;
            }
            tagged = true;
            match approval.result {
                FlagResult::Granted => {
                    if in_group(services, &approval.approver.email, group) {
                        approved = true;
                    } else {
                        invalid.insert(patch.id);
                    }
                }
                // any - or ? on a branch-tagged approval rejects
                FlagResult::Requested => {
                    pending.insert(patch.id);
                }
                FlagResult::Denied => {
                    failed.insert(patch.id);
                }
            }
        }
        if !tagged || (!approved && !failed.contains(&patch.id) && !invalid.contains(&patch.id)) {
            pending.insert(patch.id);
        }
    }

    let ids = |set: &BTreeSet<u64>| {
        set.iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    };

    let mut reasons = Vec::new();
    if !failed.is_empty() {
        reasons.push(format!(
            "Approval failed for branch {} on patch(es): {}",
            branch.name,
            ids(&failed)
        ));
    }
    if !invalid.is_empty() {
        reasons.push(format!(
            "Approver for branch {} doesn't have correct permissions on patch(es): {}",
            branch.name,
            ids(&invalid)
        ));
    }
    if !pending.is_empty() {
        reasons.push(format!(
            "Approval not yet given for branch {} on patch(es): {}",
            branch.name,
            ids(&pending)
        ));
    }
    reasons
}

// -- dispatch ---------------------------------------------------------------

/// Turn queued patchsets into `apply` jobs, oldest first. A branch at its
/// concurrency threshold defers to a later tick; a closed tree is retried
/// within its budget and fails the patchset on exhaustion.
pub fn dispatch_pending(services: &Services, reporter: &mut dyn Reporter) -> Result<()> {
    let store = &services.store;

    for ps in store.queued_patchsets()? {
        let Some(branch) = store.branch(&ps.branch)? else {
            reporter.error(&format!(
                "patchset {}: branch {} vanished from the branch table",
                ps.id, ps.branch
            ));
            fail_patchset(
                services,
                ps.id,
                ps.request_id,
                ps.bug_id,
                &format!("Branch {} is not supported.", ps.branch),
                reporter,
            )?;
            continue;
        };

        let running = store.running_jobs(&ps.branch, ps.try_run)?;
        if running >= branch.threshold {
            reporter.info(&format!(
                "branch {} at concurrency threshold ({running}); deferring patchset {}",
                ps.branch, ps.id
            ));
            continue;
        }

        if branch.use_tree_status {
            if let Err(e) = treestatus::wait_for_open(
                services.tree_status.as_ref(),
                &branch.name,
                &services.config.treestatus,
                reporter,
            ) {
                reporter.warn(&format!(
                    "patchset {}: tree gate failed for {}: {e}",
                    ps.id, branch.name
                ));
                fail_patchset(
                    services,
                    ps.id,
                    ps.request_id,
                    ps.bug_id,
                    &format!("Branch {} is closed. Won't retry anymore.", branch.name),
                    reporter,
                )?;
                continue;
            }
        }

        let patches = match services.tracker.patches(ps.bug_id, &ps.patches) {
            Ok(patches) => patches,
            Err(e) => {
                reporter.warn(&format!("patchset {}: {e}", ps.id));
                fail_patchset(
                    services,
                    ps.id,
                    ps.request_id,
                    ps.bug_id,
                    &format!("Patches could not be retrieved: {e}"),
                    reporter,
                )?;
                continue;
            }
        };

        let job = JobMessage::Patchset(PatchsetJob {
            bug_id: ps.bug_id,
            branch: ps.branch.clone(),
            branch_url: branch.pull_url.clone(),
            push_url: branch.push_url.clone(),
            try_run: ps.try_run,
            try_syntax: ps.try_syntax.clone(),
            patchsetid: ps.id,
            user: ps.author.clone(),
            to_branch: !ps.try_run,
            patches,
        });
        services
            .bus
            .publish(JOB_ROUTING_KEY, serde_json::to_value(&job)?)?;

        store.mark_in_progress(ps.id, &Utc::now())?;
        if let Some(request) = store.request(ps.request_id)? {
            if request.dispatch_id.is_none() {
                store.set_request_dispatch_id(
                    ps.request_id,
                    &format!("dispatch-{}-{}", ps.request_id, Utc::now().timestamp_micros()),
                )?;
            }
            if !request.status.is_terminal() {
                store.set_request_status(ps.request_id, RequestStatus::Dispatched)?;
            }
        }
        if let Err(e) = services.tracker.update_status("running", &ps.patches) {
            reporter.warn(&format!("patchset {}: cannot update tracker status: {e}", ps.id));
        }
        reporter.info(&format!(
            "dispatched patchset {} for bug {} to {}",
            ps.id, ps.bug_id, ps.branch
        ));
    }
    Ok(())
}

fn fail_patchset(
    services: &Services,
    patchset_id: i64,
    request_id: i64,
    bug_id: u64,
    comment: &str,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    services.store.mark_push_failed(patchset_id)?;
    post_comment(
        services,
        bug_id,
        &format!("Autoland Failure:\n\n{comment}"),
        reporter,
    );
    maybe_finalize(services, request_id, reporter)
}

// -- results ----------------------------------------------------------------

/// Drain every pending result message; returns how many were handled.
pub fn drain_results(services: &Services, reporter: &mut dyn Reporter) -> Result<usize> {
    let queue = &services.config.bus.orchestrator_queue;
    let mut handled = 0;
    while let Some(delivery) = services.bus.receive(queue)? {
        if let Err(e) = handle_message(services, delivery.envelope.payload.clone(), reporter) {
            reporter.error(&format!("result handling failed: {e:#}"));
        }
        // Acknowledge even on handler errors: a message that cannot be
        // handled now will not handle better on redelivery, and must not
        // wedge the queue.
        services.bus.ack(&delivery)?;
        handled += 1;
    }
    Ok(handled)
}

/// Handle one result/completion payload from the bus.
pub fn handle_message(
    services: &Services,
    payload: serde_json::Value,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let msg: ResultMessage = match serde_json::from_value(payload) {
        Ok(msg) => msg,
        Err(e) => {
            reporter.warn(&format!("bad result message: {e}"));
            return Ok(());
        }
    };

    // workers attach their user-facing comment to the message
    if let Some(comment) = &msg.comment {
        post_comment(services, msg.bug_id, comment, reporter);
    }

    match (msg.kind, msg.action) {
        (ResultKind::Success, ResultAction::TryPush | ResultAction::BranchPush) => {
            let Some(ps) = lookup_patchset(services, &msg, reporter)? else {
                return Ok(());
            };
            let Some(revision) = msg.revision.as_deref().filter(|r| !r.is_empty()) else {
                reporter.warn(&format!("push success for patchset {} without a revision", ps.id));
                return Ok(());
            };
            if !services.store.record_push(ps.id, revision)? {
                reporter.info(&format!(
                    "patchset {} already has a revision; ignoring redelivered result",
                    ps.id
                ));
                return Ok(());
            }
            if let Err(e) = services.tracker.remove_from_queue(&ps.patches) {
                reporter.warn(&format!("cannot update tracker queue: {e}"));
            }
            maybe_finalize(services, ps.request_id, reporter)?;
        }
        (ResultKind::Error | ResultKind::Failure, ResultAction::PatchsetApply) => {
            let Some(ps) = lookup_patchset(services, &msg, reporter)? else {
                return Ok(());
            };
            if ps.status == PatchsetStatus::Pushed {
                reporter.warn(&format!(
                    "patchset {} reported a failure after a recorded push; ignoring",
                    ps.id
                ));
                return Ok(());
            }
            services.store.mark_push_failed(ps.id)?;
            if let Err(e) = services.tracker.remove_from_queue(&ps.patches) {
                reporter.warn(&format!("cannot update tracker queue: {e}"));
            }
            maybe_finalize(services, ps.request_id, reporter)?;
        }
        (kind, ResultAction::TryRun) => {
            handle_run_completion(services, kind, &msg, reporter)?;
        }
        (kind, action) => {
            reporter.warn(&format!("unhandled result message: {kind:?} {action:?}"));
        }
    }
    Ok(())
}

fn lookup_patchset(
    services: &Services,
    msg: &ResultMessage,
    reporter: &mut dyn Reporter,
) -> Result<Option<autoland_types::Patchset>> {
    let Some(patchset_id) = msg.patchsetid else {
        reporter.warn("result message without a patchset id");
        return Ok(None);
    };
    let ps = services.store.patchset(patchset_id)?;
    if ps.is_none() {
        reporter.warn(&format!("no corresponding patchset found for {patchset_id}"));
    }
    Ok(ps)
}

/// A classifier verdict for a pushed revision: seal the patchset into the
/// `complete` table. A timeout against a still-open request forces the
/// request terminal.
fn handle_run_completion(
    services: &Services,
    kind: ResultKind,
    msg: &ResultMessage,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    let Some(revision) = msg.revision.as_deref() else {
        reporter.warn("run completion without a revision");
        return Ok(());
    };
    let Some(ps) = services.store.patchset_by_revision(revision)? else {
        reporter.warn(&format!("revision {revision} not found in database"));
        return Ok(());
    };

    let status = match kind {
        ResultKind::Success => "SUCCESS: Try run complete".to_string(),
        ResultKind::TimedOut => "Try run timed out.".to_string(),
        ResultKind::Error | ResultKind::Failure => "FAILURE: An error occurred.".to_string(),
    };
    services.store.complete_patchset(ps.id, &status)?;
    reporter.info(&format!(
        "revision {revision}: sealed patchset {} ({status})",
        ps.id
    ));

    if kind == ResultKind::TimedOut {
        if let Some(request) = services.store.request(ps.request_id)? {
            if !request.status.is_terminal() {
                services
                    .store
                    .set_request_status(ps.request_id, RequestStatus::TimedOut)?;
            }
        }
    }
    Ok(())
}

/// The per-request barrier: once every patchset is terminal, write the
/// terminal request status exactly once, update the tracker, and post one
/// summary comment.
fn maybe_finalize(services: &Services, request_id: i64, reporter: &mut dyn Reporter) -> Result<()> {
    let store = &services.store;
    let Some(request) = store.request(request_id)? else {
        return Ok(());
    };
    if request.status.is_terminal() {
        return Ok(());
    }

    let patchsets = store.patchsets_for_request(request_id)?;
    if patchsets.len() < request.branches.len()
        || patchsets.iter().any(|ps| !ps.status.is_terminal())
    {
        return Ok(());
    }

    let all_pushed = patchsets
        .iter()
        .all(|ps| ps.status == PatchsetStatus::Pushed);
    let status = if all_pushed {
        RequestStatus::Success
    } else {
        RequestStatus::PushFailure
    };
    store.set_request_status(request_id, status)?;

    let tracker_status = if all_pushed { "success" } else { "failed" };
    if let Err(e) = services
        .tracker
        .update_status(tracker_status, &request.patches)
    {
        reporter.warn(&format!("cannot update tracker status: {e}"));
    }

    let mut lines = Vec::new();
    for ps in &patchsets {
        match (&ps.status, &ps.revision) {
            (PatchsetStatus::Pushed, Some(revision)) => {
                lines.push(format!("\t{}: pushed, revision {revision}", ps.branch));
            }
            _ => lines.push(format!("\t{}: failed", ps.branch)),
        }
    }
    let summary = if all_pushed {
        format!(
            "Autoland request for bug {} is complete; patches {} landed on every \
             requested branch.\n{}",
            request.bug_id,
            join_ids(&request.patches),
            lines.join("\n")
        )
    } else {
        format!(
            "Autoland Failure:\n\nBug {} could not be landed on every requested branch.\n{}",
            request.bug_id,
            lines.join("\n")
        )
    };
    post_comment(services, request.bug_id, &summary, reporter);
    reporter.info(&format!(
        "request {request_id} finalized as {}",
        status.as_str()
    ));
    Ok(())
}

/// Drain the orchestrator's own queue after operator confirmation
/// (`--purge-queue`).
pub fn purge_queue(services: &Services) -> Result<usize> {
    let queue = &services.config.bus.orchestrator_queue;
    services.bus.bind(queue, RESULT_ROUTING_KEY)?;
    services.bus.purge(queue).context("purging result queue")
}

/// Pending depth of the orchestrator's queue (for the purge prompt).
pub fn queue_depth(services: &Services) -> Result<usize> {
    let queue = &services.config.bus.orchestrator_queue;
    services.bus.bind(queue, RESULT_ROUTING_KEY)?;
    services.bus.depth(queue)
}
