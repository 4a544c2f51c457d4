//! Commit-message rewriting.
//!
//! Landed patches carry their review and approval credits in the commit
//! message: `r=`/`sr=`/`ui-r=` tokens in review-list order, a single
//! `a=<e1,e2,…>` of branch-tagged approvers on branch landings, and a
//! trailing `(al=<landing user>; Bug <id>)`. The rewrite first strips any
//! credits already present, which makes it idempotent: rewriting an
//! already-rewritten message reproduces it exactly.

use std::sync::OnceLock;

use autoland_types::Patch;
use regex::Regex;

fn credit_tail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // the al value is an address: never contains '(', ')', or ';'
    RE.get_or_init(|| Regex::new(r"\(al=[^();]*;\s*Bug\s+\d+\)").expect("al-tail regex"))
}

fn credit_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // ui-r before r so the alternation consumes the whole token
    RE.get_or_init(|| Regex::new(r"(^|\s)(ui-r|sr|r|a)=\S+").expect("credit-token regex"))
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"))
}

/// Collapse a message to its first line and remove every credit token
/// (`r=`, `sr=`, `ui-r=`, `a=`) and any `(al=…; Bug …)` tail.
pub fn strip_credits(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("");
    let without_tail = credit_tail_re().replace_all(first_line, "");
    let without_tokens = credit_token_re().replace_all(&without_tail, " ");
    whitespace_re()
        .replace_all(&without_tokens, " ")
        .trim()
        .to_string()
}

/// Rewrite a commit message with the patch's credits. Review credits are
/// appended in review-list order; approval credits only on branch landings
/// (not try runs), restricted to branch-tagged grants.
pub fn rewrite_message(
    message: &str,
    patch: &Patch,
    branch: &str,
    landing_user: &str,
    bug_id: u64,
    try_run: bool,
) -> String {
    let mut msg = strip_credits(message);

    for review in &patch.reviews {
        msg.push_str(&format!(
            " {}={}",
            review.kind.credit_tag(),
            review.reviewer.email
        ));
    }

    if !try_run {
        let approvers: Vec<&str> = patch
            .granted_approvals_for(branch)
            .iter()
            .map(|a| a.approver.email.as_str())
            .collect();
        if !approvers.is_empty() {
            msg.push_str(&format!(" a={}", approvers.join(",")));
        }
    }

    msg.push_str(&format!(" (al={landing_user}; Bug {bug_id})"));
    msg.trim().to_string()
}

/// Fallback when no commit message can be derived from the patch.
pub fn fallback_message(bug_id: u64, summary: &str) -> String {
    format!("Bug {bug_id} - {summary}")
}

/// The no-op commit that carries try syntax into the push log.
pub fn try_commit_message(try_syntax: &str, bug_id: u64, to_branch: bool, staging: bool) -> String {
    let mut msg = format!("try: {try_syntax} -n");
    if staging {
        msg.push_str(&format!(" bug {bug_id}"));
    } else {
        msg.push_str(&format!(" --post-to-bugzilla bug {bug_id}"));
    }
    if to_branch {
        msg.push_str(" --retry-oranges");
    }
    msg
}

#[cfg(test)]
mod tests {
    use autoland_types::{Approval, FlagResult, Person, Review, ReviewKind};
    use proptest::prelude::*;

    use super::*;

    fn person(email: &str) -> Person {
        Person {
            name: email.split('@').next().unwrap_or("x").to_string(),
            email: email.to_string(),
        }
    }

    fn patch() -> Patch {
        Patch {
            id: 600,
            author: person("alice@example.org"),
            reviews: vec![
                Review {
                    kind: ReviewKind::Review,
                    reviewer: person("bob@example.org"),
                    result: FlagResult::Granted,
                },
                Review {
                    kind: ReviewKind::Super,
                    reviewer: person("carol@example.org"),
                    result: FlagResult::Granted,
                },
            ],
            approvals: vec![
                Approval {
                    branch: "release".into(),
                    approver: person("dan@example.org"),
                    result: FlagResult::Granted,
                },
                Approval {
                    branch: "beta".into(),
                    approver: person("erin@example.org"),
                    result: FlagResult::Granted,
                },
            ],
        }
    }

    #[test]
    fn strips_existing_tokens_and_tail() {
        assert_eq!(
            strip_credits("Bug 600 - fix r=old sr=older a=app (al=who; Bug 600)"),
            "Bug 600 - fix"
        );
    }

    #[test]
    fn strip_keeps_lookalike_words() {
        // r= inside a word is not a credit token
        assert_eq!(strip_credits("honor=system car=5"), "honor=system car=5");
    }

    #[test]
    fn strip_collapses_to_first_line() {
        assert_eq!(strip_credits("first line\nsecond line"), "first line");
    }

    #[test]
    fn rewrite_appends_credits_in_review_order() {
        let msg = rewrite_message(
            "Bug 600 - fix the frobnicator",
            &patch(),
            "release",
            "lander@example.org",
            600,
            false,
        );
        assert_eq!(
            msg,
            "Bug 600 - fix the frobnicator r=bob@example.org sr=carol@example.org \
             a=dan@example.org (al=lander@example.org; Bug 600)"
        );
    }

    #[test]
    fn try_runs_carry_no_approval_credits() {
        let msg = rewrite_message(
            "Bug 600 - fix",
            &patch(),
            "release",
            "lander@example.org",
            600,
            true,
        );
        assert!(!msg.contains("a=dan"));
        assert!(msg.contains("r=bob@example.org"));
        assert!(msg.ends_with("(al=lander@example.org; Bug 600)"));
    }

    #[test]
    fn only_branch_tagged_grants_become_approval_credits() {
        let mut p = patch();
        p.approvals.push(Approval {
            branch: "release".into(),
            approver: person("frank@example.org"),
            result: FlagResult::Denied,
        });
        let msg = rewrite_message("fix", &p, "release", "lander@example.org", 600, false);
        assert!(msg.contains("a=dan@example.org"));
        assert!(!msg.contains("erin"));
        assert!(!msg.contains("frank"));
    }

    #[test]
    fn stale_credits_are_replaced_not_duplicated() {
        let once = rewrite_message(
            "fix r=stale@example.org a=gone@example.org",
            &patch(),
            "release",
            "lander@example.org",
            600,
            false,
        );
        assert!(!once.contains("stale"));
        assert!(!once.contains("gone"));
        assert_eq!(once.matches("r=bob@example.org").count(), 1);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let once = rewrite_message(
            "Bug 600 - fix; r=old",
            &patch(),
            "release",
            "lander@example.org",
            600,
            false,
        );
        let twice = rewrite_message(&once, &patch(), "release", "lander@example.org", 600, false);
        assert_eq!(once, twice);
    }

    proptest! {
        #[test]
        fn rewrite_idempotent_for_arbitrary_messages(message in ".{0,120}") {
            let p = patch();
            let once = rewrite_message(&message, &p, "release", "lander@example.org", 600, false);
            let twice = rewrite_message(&once, &p, "release", "lander@example.org", 600, false);
            prop_assert_eq!(once, twice);
        }
    }

    #[test]
    fn fallback_uses_bug_and_summary() {
        assert_eq!(
            fallback_message(600, "frobnicator is broken"),
            "Bug 600 - frobnicator is broken"
        );
    }

    #[test]
    fn try_commit_message_shapes() {
        assert_eq!(
            try_commit_message("-b do -p all", 600, false, false),
            "try: -b do -p all -n --post-to-bugzilla bug 600"
        );
        assert_eq!(
            try_commit_message("-p all", 600, true, false),
            "try: -p all -n --post-to-bugzilla bug 600 --retry-oranges"
        );
        assert_eq!(
            try_commit_message("-p all", 600, false, true),
            "try: -p all -n bug 600"
        );
    }
}
