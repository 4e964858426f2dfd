//! Operator-driven resolution of accounts the matching engine left unmatched.
//!
//! One record at a time: show ranked candidates, read one line, and stay on
//! the record until the operator skips it (blank line) or picks a valid
//! index. End of input cancels everything not yet decided.

use std::collections::HashSet;
use std::io::{self, BufRead, Write};

use idrec_core::{AccountKind, ExternalAccount, Profile, MATCHES_CATEGORY};
use idrec_storage::{OverrideStore, PutOutcome};
use strsim::jaro_winkler;
use tracing::{info, warn};

use crate::matching::{AccountMatch, MatchMethod};

/// Line-oriented operator terminal.
pub trait OperatorIo: Send {
    /// `Ok(None)` at end of input.
    fn read_line(&mut self) -> io::Result<Option<String>>;
    fn write_text(&mut self, text: &str) -> io::Result<()>;
}

pub struct Operator<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead + Send, W: Write + Send> Operator<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_output(self) -> W {
        self.output
    }
}

impl Operator<io::BufReader<io::Stdin>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R: BufRead + Send, W: Write + Send> OperatorIo for Operator<R, W> {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    fn write_text(&mut self, text: &str) -> io::Result<()> {
        self.output.write_all(text.as_bytes())?;
        self.output.flush()
    }
}

/// What one line of input does to the current record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Reprompt(String),
    Skip,
    Select(usize),
    Cancel,
}

/// Transition out of the awaiting-selection state. `candidates` is the
/// number of listed choices; valid selections are `1..=candidates`.
pub fn interpret(line: Option<&str>, candidates: usize) -> Step {
    let Some(line) = line else {
        return Step::Cancel;
    };
    let line = line.trim();
    if line.is_empty() {
        return Step::Skip;
    }
    match line.parse::<usize>() {
        Ok(n) if (1..=candidates).contains(&n) => Step::Select(n - 1),
        Ok(n) => Step::Reprompt(format!("{n} is not between 1 and {candidates}")),
        Err(_) => Step::Reprompt(format!("{line:?} is not a number")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Skip,
    Select(usize),
    Cancel,
}

#[derive(Debug, Clone, Default)]
pub struct PromptOutcome {
    pub matches: Vec<AccountMatch>,
    /// Skipped by the operator or left over after cancellation.
    pub unmatched: Vec<ExternalAccount>,
    pub new_overrides: Vec<(String, String)>,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct InteractiveResolver {
    candidate_limit: usize,
}

impl Default for InteractiveResolver {
    fn default() -> Self {
        Self { candidate_limit: 10 }
    }
}

impl InteractiveResolver {
    pub fn new(candidate_limit: usize) -> Self {
        Self {
            candidate_limit: candidate_limit.max(1),
        }
    }

    /// Profiles that do not yet hold an account of this kind, ranked by name
    /// similarity, ties broken by key.
    pub fn candidates<'p>(
        &self,
        account: &ExternalAccount,
        profiles: &'p [Profile],
        claimed: &HashSet<(AccountKind, String)>,
    ) -> Vec<&'p Profile> {
        let probe = account
            .name
            .as_deref()
            .unwrap_or(&account.username)
            .to_lowercase();
        let mut ranked: Vec<(f64, &Profile)> = profiles
            .iter()
            .filter(|p| !claimed.contains(&(account.kind, p.key.clone())))
            .map(|p| (jaro_winkler(&probe, &p.name.to_lowercase()), p))
            .collect();
        ranked.sort_by(|(sa, pa), (sb, pb)| sb.total_cmp(sa).then_with(|| pa.key.cmp(&pb.key)));
        ranked
            .into_iter()
            .take(self.candidate_limit)
            .map(|(_, p)| p)
            .collect()
    }

    pub fn resolve(
        &self,
        unmatched: Vec<ExternalAccount>,
        profiles: &[Profile],
        mut claimed: HashSet<(AccountKind, String)>,
        overrides: &mut OverrideStore,
        operator: &mut dyn OperatorIo,
    ) -> PromptOutcome {
        let mut outcome = PromptOutcome::default();
        let mut pending = unmatched.into_iter();

        while let Some(account) = pending.next() {
            let candidates = self.candidates(&account, profiles, &claimed);
            let decision = match ask(operator, &account, &candidates) {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(error = %err, "operator terminal failed, cancelling prompt");
                    Decision::Cancel
                }
            };

            match decision {
                Decision::Skip => outcome.unmatched.push(account),
                Decision::Select(idx) => {
                    let key = candidates[idx].key.clone();
                    match overrides.put(MATCHES_CATEGORY, key.clone(), account.username.clone()) {
                        PutOutcome::Reassigned { previous } => info!(
                            profile = %key,
                            previous = %previous,
                            username = %account.username,
                            "operator reassigned override"
                        ),
                        _ => info!(profile = %key, username = %account.username, "operator matched account"),
                    }
                    claimed.insert((account.kind, key.clone()));
                    outcome
                        .new_overrides
                        .push((key.clone(), account.username.clone()));
                    outcome.matches.push(AccountMatch {
                        profile_key: key,
                        method: MatchMethod::Interactive,
                        account,
                    });
                }
                Decision::Cancel => {
                    outcome.cancelled = true;
                    outcome.unmatched.push(account);
                    outcome.unmatched.extend(pending.by_ref());
                }
            }
        }
        outcome
    }
}

fn ask(
    operator: &mut dyn OperatorIo,
    account: &ExternalAccount,
    candidates: &[&Profile],
) -> io::Result<Decision> {
    let mut text = format!(
        "\nUnmatched cluster {} account: username={} email={} name={}\n",
        account.kind,
        account.username,
        account.email.as_deref().unwrap_or("-"),
        account.name.as_deref().unwrap_or("-"),
    );
    if candidates.is_empty() {
        text.push_str("  no candidate profiles left, skipping\n");
        operator.write_text(&text)?;
        return Ok(Decision::Skip);
    }
    for (idx, p) in candidates.iter().enumerate() {
        text.push_str(&format!("  [{}] {} <{}>\n", idx + 1, p.name, p.key));
    }
    operator.write_text(&text)?;

    loop {
        operator.write_text(&format!(
            "Select 1-{} or press Enter to skip: ",
            candidates.len()
        ))?;
        let line = operator.read_line()?;
        match interpret(line.as_deref(), candidates.len()) {
            Step::Reprompt(reason) => operator.write_text(&format!("  invalid selection: {reason}\n"))?,
            Step::Skip => return Ok(Decision::Skip),
            Step::Select(idx) => return Ok(Decision::Select(idx)),
            Step::Cancel => return Ok(Decision::Cancel),
        }
    }
}
