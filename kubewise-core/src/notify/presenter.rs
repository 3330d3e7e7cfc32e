//! Human-readable messages for release events.

use std::fmt::Write as _;

use crate::model::{Release, ReleaseAction, ReleaseEvent, ReleaseStatus};

fn chart_label(release: &Release) -> String {
    match (release.chart_name(), release.chart_version()) {
        (Some(name), Some(version)) if !version.is_empty() => format!("`{name}` {version}"),
        (Some(name), _) => format!("`{name}`"),
        _ => "an unknown chart".to_string(),
    }
}

fn subject(release: &Release) -> String {
    format!(
        "*{}* in namespace `{}`",
        release.name,
        if release.namespace.is_empty() { "default" } else { release.namespace.as_str() }
    )
}

/// One-line markdown message for `event`; empty when the action is not
/// user-facing.
pub fn event_message(event: &ReleaseEvent) -> String {
    let release = &event.release;
    let failed = release.status() == ReleaseStatus::Failed;
    match event.action {
        ReleaseAction::Install if failed => format!(
            ":x: Installation of {} using {} failed",
            subject(release),
            chart_label(release)
        ),
        ReleaseAction::Install => format!(
            ":rocket: {} was installed using {}",
            subject(release),
            chart_label(release)
        ),
        ReleaseAction::Upgrade if failed => format!(
            ":x: Upgrade of {} to revision {} ({}) failed",
            subject(release),
            release.version,
            chart_label(release)
        ),
        ReleaseAction::Upgrade => format!(
            ":arrow_up: {} was upgraded to revision {} using {}",
            subject(release),
            release.version,
            chart_label(release)
        ),
        ReleaseAction::Uninstall => format!(":wastebasket: {} was uninstalled", subject(release)),
        ReleaseAction::SupersededReplace | ReleaseAction::Unknown => String::new(),
    }
}

/// Inventory of deployed releases sent once at boot.
pub fn startup_message(releases: &[Release]) -> String {
    let mut deployed: Vec<&Release> = releases
        .iter()
        .filter(|release| release.status() == ReleaseStatus::Deployed)
        .collect();
    deployed.sort_by(|l, r| (&l.namespace, &l.name).cmp(&(&r.namespace, &r.name)));

    let mut message = match deployed.len() {
        0 => return ":wave: KubeWise is watching for Helm releases. None are deployed yet.".into(),
        1 => ":wave: KubeWise is watching 1 deployed Helm release:".to_string(),
        n => format!(":wave: KubeWise is watching {n} deployed Helm releases:"),
    };
    for release in deployed {
        let _ = write!(
            message,
            "\n• {} (revision {}, {})",
            subject(release),
            release.version,
            chart_label(release)
        );
    }
    message
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::model::release::fixtures::release_json;
    use crate::model::{RawEventType, WatchedObject};

    fn release(name: &str, version: u32, status: &str) -> Release {
        serde_json::from_value(release_json(name, "team-a", version, status)).expect("release")
    }

    fn event(action: ReleaseAction, release: Release) -> ReleaseEvent {
        ReleaseEvent {
            raw_type: RawEventType::Update,
            snapshot: Arc::new(
                WatchedObject::from_value(json!({ "metadata": { "name": "x" } })).expect("object"),
            ),
            release,
            action,
        }
    }

    #[test]
    fn renders_user_facing_actions() {
        let install = event_message(&event(ReleaseAction::Install, release("web", 1, "deployed")));
        assert_eq!(
            install,
            ":rocket: *web* in namespace `team-a` was installed using `nginx` 15.1.0"
        );

        let upgrade = event_message(&event(ReleaseAction::Upgrade, release("web", 4, "deployed")));
        assert!(upgrade.contains("revision 4"), "{upgrade}");

        let failed = event_message(&event(ReleaseAction::Upgrade, release("web", 4, "failed")));
        assert!(failed.starts_with(":x:"), "{failed}");
    }

    #[test]
    fn internal_actions_render_nothing() {
        for action in [ReleaseAction::SupersededReplace, ReleaseAction::Unknown] {
            assert!(event_message(&event(action, release("web", 2, "superseded"))).is_empty());
        }
    }

    #[test]
    fn startup_lists_only_deployed_releases() {
        let message = startup_message(&[
            release("web", 3, "deployed"),
            release("api", 1, "deployed"),
            release("old", 2, "superseded"),
        ]);
        assert!(message.contains("2 deployed Helm releases"), "{message}");
        let api = message.find("*api*").expect("api listed");
        let web = message.find("*web*").expect("web listed");
        assert!(api < web);
        assert!(!message.contains("*old*"));
    }
}
