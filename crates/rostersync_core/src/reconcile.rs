//! Reconciliation runs.
//!
//! A run walks each team in scope, discovers roster entries, and drives every
//! entry through `Extracted -> Resolved -> Matched|Unmatched ->
//! Applied|Skipped|Flagged`. Entries are processed one at a time against a
//! single page source; a failure only ever aborts the entry it belongs to.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{RosterConfig, RunMode, SourceProfile};
use crate::extract::extract_candidate;
use crate::matcher::{MatchOutcome, ScrapedEntry, match_entry};
use crate::resolve::resolve_address;
use crate::roster::discover_entries;
use crate::source::{PageSource, SourceErrorKind};
use crate::store::{Athlete, AthletePatch, CanonicalStore, Team};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOptions {
    pub mode: RunMode,
    pub teams: Vec<String>,
    pub dry_run: bool,
    pub keep_existing_photo_on_fallback: bool,
}

impl RunOptions {
    pub fn from_config(config: &RosterConfig) -> Result<Self> {
        Ok(Self {
            mode: config.run.mode()?,
            teams: config.run.teams.clone(),
            dry_run: config.run.dry_run,
            keep_existing_photo_on_fallback: config.run.keep_existing_photo_on_fallback,
        })
    }
}

/// Shared flag checked between entries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Extracted,
    Resolved,
    Matched,
    Unmatched,
    Applied,
    Skipped,
    Flagged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    Updated,
    Inserted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Unchanged,
    UpdateOnly,
    Source(SourceErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    DuplicateMatch { athlete_ids: Vec<i64> },
    StoreWrite { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Applied { action: WriteAction },
    Skipped { reason: SkipReason },
    Flagged { reason: FlagReason },
}

impl Outcome {
    pub fn label(&self) -> String {
        match self {
            Self::Applied { action } => match action {
                WriteAction::Updated => "applied:update".to_string(),
                WriteAction::Inserted => "applied:insert".to_string(),
            },
            Self::Skipped { reason } => match reason {
                SkipReason::Unchanged => "skipped:unchanged".to_string(),
                SkipReason::UpdateOnly => "skipped:update-only".to_string(),
                SkipReason::Source(kind) => format!("skipped:{}", kind.as_str()),
            },
            Self::Flagged { reason } => match reason {
                FlagReason::DuplicateMatch { .. } => "flagged:duplicate".to_string(),
                FlagReason::StoreWrite { .. } => "flagged:store-write".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryReport {
    pub team_id: String,
    pub display_name: String,
    pub profile_address: String,
    pub trail: Vec<EntryState>,
    pub candidate_address: Option<String>,
    pub photo_address: Option<String>,
    pub used_fallback: bool,
    pub athlete_id: Option<i64>,
    pub detail: Option<String>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamReport {
    pub team_id: String,
    pub source: String,
    pub entries_found: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub updated: usize,
    pub inserted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub flagged: usize,
    pub writes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub dry_run: bool,
    pub cancelled: bool,
    pub teams: Vec<TeamReport>,
    pub entries: Vec<EntryReport>,
    pub counts: RunCounts,
}

/// Receives progress as the run advances.
pub trait RunObserver {
    fn team_started(&mut self, _team: &Team, _entries: usize) {}
    fn team_failed(&mut self, _team_id: &str, _error: &str) {}
    fn entry_finished(&mut self, _entry: &EntryReport) {}
}

pub struct NoopObserver;

impl RunObserver for NoopObserver {}

pub fn run_reconciliation(
    config: &RosterConfig,
    options: &RunOptions,
    source: &mut dyn PageSource,
    store: &mut dyn CanonicalStore,
    observer: &mut dyn RunObserver,
    cancel: &CancelFlag,
) -> Result<RunReport> {
    let mut report = RunReport {
        mode: options.mode,
        dry_run: options.dry_run,
        cancelled: false,
        teams: Vec::new(),
        entries: Vec::new(),
        counts: RunCounts::default(),
    };

    let scope = resolve_scope(store, &options.teams)?;
    info!(
        teams = scope.len(),
        mode = options.mode.as_str(),
        dry_run = options.dry_run,
        "starting reconciliation run"
    );

    'teams: for scoped in scope {
        let team = match scoped {
            Ok(team) => team,
            Err(team_id) => {
                let error = "team not found in store".to_string();
                observer.team_failed(&team_id, &error);
                report.teams.push(TeamReport {
                    team_id,
                    source: String::new(),
                    entries_found: 0,
                    error: Some(error),
                });
                continue;
            }
        };
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let profile = config.profile_for_address(&team.roster_address);
        let prepared = fetch_roster(&team, &profile, source, store);
        let (entries, mut athletes) = match prepared {
            Ok(prepared) => prepared,
            Err(error) => {
                warn!(team = %team.id, %error, "roster unavailable");
                observer.team_failed(&team.id, &error);
                report.teams.push(TeamReport {
                    team_id: team.id.clone(),
                    source: profile.name.clone(),
                    entries_found: 0,
                    error: Some(error),
                });
                continue;
            }
        };

        info!(team = %team.id, source = %profile.name, entries = entries.len(), "roster loaded");
        observer.team_started(&team, entries.len());
        report.teams.push(TeamReport {
            team_id: team.id.clone(),
            source: profile.name.clone(),
            entries_found: entries.len(),
            error: None,
        });

        let mut claimed = BTreeSet::<i64>::new();
        for entry in &entries {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break 'teams;
            }
            let entry_report = process_entry(
                &team,
                entry,
                &profile,
                options,
                source,
                store,
                &mut athletes,
                &mut claimed,
            );
            tally(&mut report.counts, &entry_report.outcome, options.dry_run);
            observer.entry_finished(&entry_report);
            report.entries.push(entry_report);
        }
    }

    info!(
        updated = report.counts.updated,
        inserted = report.counts.inserted,
        unchanged = report.counts.unchanged,
        skipped = report.counts.skipped,
        flagged = report.counts.flagged,
        cancelled = report.cancelled,
        "reconciliation run finished"
    );
    Ok(report)
}

/// Teams in scope, in order. Unknown ids come back as `Err(id)`.
fn resolve_scope(
    store: &dyn CanonicalStore,
    team_ids: &[String],
) -> Result<Vec<Result<Team, String>>> {
    if team_ids.is_empty() {
        let teams = store.list_teams().context("failed to list teams")?;
        return Ok(teams.into_iter().map(Ok).collect());
    }
    let mut output = Vec::with_capacity(team_ids.len());
    for team_id in team_ids {
        let team = store
            .get_team(team_id)
            .with_context(|| format!("failed to read team {team_id}"))?;
        output.push(team.ok_or_else(|| team_id.clone()));
    }
    Ok(output)
}

fn fetch_roster(
    team: &Team,
    profile: &SourceProfile,
    source: &mut dyn PageSource,
    store: &dyn CanonicalStore,
) -> Result<(Vec<ScrapedEntry>, Vec<Athlete>), String> {
    let document = source
        .fetch(&team.roster_address)
        .map_err(|error| error.to_string())?;
    let entries = discover_entries(&document, &profile.roster);
    let athletes = store
        .list_athletes(&team.id)
        .map_err(|error| format!("failed to list athletes: {error}"))?;
    Ok((entries, athletes))
}

fn process_entry(
    team: &Team,
    entry: &ScrapedEntry,
    profile: &SourceProfile,
    options: &RunOptions,
    source: &mut dyn PageSource,
    store: &mut dyn CanonicalStore,
    athletes: &mut Vec<Athlete>,
    claimed: &mut BTreeSet<i64>,
) -> EntryReport {
    let mut report = EntryReport {
        team_id: team.id.clone(),
        display_name: entry.display_name.clone(),
        profile_address: entry.profile_address.clone(),
        trail: Vec::new(),
        candidate_address: None,
        photo_address: None,
        used_fallback: false,
        athlete_id: None,
        detail: None,
        outcome: Outcome::Skipped {
            reason: SkipReason::Unchanged,
        },
    };

    // Entries that can only end as Flagged or update-only Skipped do not
    // need their profile page fetched.
    let early = match_entry(entry, athletes);
    match &early {
        MatchOutcome::Duplicate(ids) => {
            return flag_duplicate(report, ids.clone());
        }
        // Two roster entries resolving to one athlete would rewrite that
        // record back and forth on every run.
        MatchOutcome::Matched(athlete) => {
            if !claimed.insert(athlete.id) {
                return flag_duplicate(report, vec![athlete.id]);
            }
        }
        MatchOutcome::NoMatch if !options.mode.allows_insert() => {
            report.trail.push(EntryState::Unmatched);
            return skip_update_only(report);
        }
        _ => {}
    }

    let document = match source.fetch(&entry.profile_address) {
        Ok(document) => document,
        Err(error) => {
            warn!(team = %team.id, name = %entry.display_name, %error, "profile fetch failed");
            report.detail = Some(error.to_string());
            report.trail.push(EntryState::Skipped);
            report.outcome = Outcome::Skipped {
                reason: SkipReason::Source(error.kind()),
            };
            return report;
        }
    };

    let candidate = extract_candidate(&document, &profile.extraction);
    report.trail.push(EntryState::Extracted);

    let photo_address = match &candidate {
        Some(candidate) => {
            let resolution = resolve_address(&candidate.address, &profile.resolver);
            debug!(
                name = %entry.display_name,
                candidate = %candidate.address,
                resolved = %resolution.resolved,
                "photo resolved"
            );
            report.candidate_address = Some(candidate.address.clone());
            resolution.resolved
        }
        None => {
            report.used_fallback = true;
            team.logo_address.clone()
        }
    };
    report.trail.push(EntryState::Resolved);

    match early {
        MatchOutcome::Matched(athlete) => {
            report.trail.push(EntryState::Matched);
            report.athlete_id = Some(athlete.id);
            let photo_address = if report.used_fallback
                && options.keep_existing_photo_on_fallback
                && athlete
                    .photo_address
                    .as_deref()
                    .is_some_and(|current| !current.is_empty() && current != team.logo_address)
            {
                athlete.photo_address.clone().unwrap_or(photo_address)
            } else {
                photo_address
            };
            report.photo_address = Some(photo_address.clone());

            let patch = AthletePatch {
                photo_address: (athlete.photo_address.as_deref() != Some(photo_address.as_str()))
                    .then(|| photo_address.clone()),
                profile_address: (athlete.profile_address.as_deref()
                    != Some(entry.profile_address.as_str()))
                .then(|| entry.profile_address.clone()),
            };
            if patch.is_empty() {
                report.trail.push(EntryState::Skipped);
                report.outcome = Outcome::Skipped {
                    reason: SkipReason::Unchanged,
                };
                return report;
            }
            if options.dry_run {
                return applied(report, WriteAction::Updated);
            }
            match store.update_athlete(athlete.id, &patch) {
                Ok(()) => {
                    if let Some(stored) = athletes.iter_mut().find(|row| row.id == athlete.id) {
                        if let Some(photo) = &patch.photo_address {
                            stored.photo_address = Some(photo.clone());
                        }
                        if let Some(profile_address) = &patch.profile_address {
                            stored.profile_address = Some(profile_address.clone());
                        }
                    }
                    applied(report, WriteAction::Updated)
                }
                Err(error) => flag_store_write(report, error.to_string()),
            }
        }
        MatchOutcome::NoMatch => {
            report.trail.push(EntryState::Unmatched);
            report.photo_address = Some(photo_address.clone());
            if options.dry_run {
                return applied(report, WriteAction::Inserted);
            }
            match store.insert_athlete(
                &team.id,
                &entry.display_name,
                Some(&photo_address),
                Some(&entry.profile_address),
            ) {
                Ok(id) => {
                    report.athlete_id = Some(id);
                    claimed.insert(id);
                    athletes.push(Athlete {
                        id,
                        team_id: team.id.clone(),
                        name: entry.display_name.clone(),
                        photo_address: Some(photo_address),
                        profile_address: Some(entry.profile_address.clone()),
                    });
                    applied(report, WriteAction::Inserted)
                }
                Err(error) => flag_store_write(report, error.to_string()),
            }
        }
        MatchOutcome::Duplicate(ids) => flag_duplicate(report, ids),
    }
}

fn applied(mut report: EntryReport, action: WriteAction) -> EntryReport {
    report.trail.push(EntryState::Applied);
    report.outcome = Outcome::Applied { action };
    report
}

fn skip_update_only(mut report: EntryReport) -> EntryReport {
    info!(
        team = %report.team_id,
        name = %report.display_name,
        "unmatched entry skipped in update-only run"
    );
    report.trail.push(EntryState::Skipped);
    report.outcome = Outcome::Skipped {
        reason: SkipReason::UpdateOnly,
    };
    report
}

fn flag_duplicate(mut report: EntryReport, athlete_ids: Vec<i64>) -> EntryReport {
    warn!(
        team = %report.team_id,
        name = %report.display_name,
        ?athlete_ids,
        "duplicate canonical match"
    );
    report.trail.push(EntryState::Flagged);
    report.outcome = Outcome::Flagged {
        reason: FlagReason::DuplicateMatch { athlete_ids },
    };
    report
}

fn flag_store_write(mut report: EntryReport, message: String) -> EntryReport {
    warn!(
        team = %report.team_id,
        name = %report.display_name,
        profile = %report.profile_address,
        error = %message,
        "store write failed"
    );
    report.trail.push(EntryState::Flagged);
    report.outcome = Outcome::Flagged {
        reason: FlagReason::StoreWrite { message },
    };
    report
}

fn tally(counts: &mut RunCounts, outcome: &Outcome, dry_run: bool) {
    match outcome {
        Outcome::Applied { action } => {
            match action {
                WriteAction::Updated => counts.updated += 1,
                WriteAction::Inserted => counts.inserted += 1,
            }
            if !dry_run {
                counts.writes += 1;
            }
        }
        Outcome::Skipped {
            reason: SkipReason::Unchanged,
        } => counts.unchanged += 1,
        Outcome::Skipped { .. } => counts.skipped += 1,
        Outcome::Flagged { .. } => counts.flagged += 1,
    }
}
