//! The public output form of a record.
//!
//! External records deep-copy every scalar they need at construction and
//! hold no snapshot references, so they can outlive the chain that produced
//! them and sit in the batch queue unencumbered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::GeneralConfig;

use super::record::{CdrRecord, Disposition};
use super::snapshot::Variables;

/// A finalized, externalized call record: the classic billing columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalRecord {
    /// Caller id in `"Name" <number>` form.
    pub clid: String,
    /// Source (caller) number.
    pub src: String,
    /// Destination extension.
    pub dst: String,
    /// Destination context.
    pub dcontext: String,
    /// Party A channel name.
    pub channel: String,
    /// Party B channel name; empty for single-party records.
    #[serde(default)]
    pub dstchannel: String,
    #[serde(default)]
    pub lastapp: String,
    #[serde(default)]
    pub lastdata: String,
    pub start: Option<DateTime<Utc>>,
    pub answer: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Whole seconds from start to end.
    pub duration: i64,
    /// Whole seconds from answer to end; zero when unanswered.
    pub billsec: i64,
    pub disposition: Disposition,
    pub amaflags: u32,
    #[serde(default)]
    pub accountcode: String,
    #[serde(default)]
    pub peeraccount: String,
    pub uniqueid: String,
    #[serde(default)]
    pub linkedid: String,
    #[serde(default)]
    pub userfield: String,
    pub sequence: u32,
    /// Party A variables first, then Party B variables not shadowed by
    /// name. Empty values are dropped.
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub variables: Variables,
    /// Record was marked DISABLE; the post filter drops it.
    #[serde(skip)]
    pub(crate) disabled: bool,
}

impl ExternalRecord {
    /// Deep-copy a chain record into its external form.
    pub fn from_record(record: &CdrRecord, settings: &GeneralConfig) -> Self {
        let party_a = &record.party_a;
        let party_b = record.party_b.as_ref();

        let userfield = match party_b.map(|b| b.userfield.as_str()) {
            Some(b_field) if !b_field.is_empty() => {
                format!("{};{}", party_a.userfield, b_field)
            }
            _ => party_a.userfield.clone(),
        };

        let mut variables = Variables::new();
        variables.merge_missing(&party_a.variables);
        if let Some(party_b) = party_b {
            variables.merge_missing(&party_b.variables);
        }

        Self {
            clid: party_a.snapshot.callerid(),
            src: party_a.snapshot.caller_number.clone(),
            dst: party_a.snapshot.exten.clone(),
            dcontext: party_a.snapshot.context.clone(),
            channel: party_a.snapshot.name.clone(),
            dstchannel: party_b
                .map(|b| b.snapshot.name.clone())
                .unwrap_or_default(),
            lastapp: record.appl.clone(),
            lastdata: record.data.clone(),
            start: record.start,
            answer: record.answer,
            end: record.end,
            duration: record.duration(),
            billsec: record.billsec(settings),
            disposition: record.disposition,
            amaflags: party_a.snapshot.amaflags,
            accountcode: party_a.snapshot.accountcode.clone(),
            peeraccount: party_b
                .map(|b| b.snapshot.accountcode.clone())
                .unwrap_or_default(),
            uniqueid: party_a.snapshot.uniqueid.clone(),
            linkedid: record.linkedid.clone(),
            userfield,
            sequence: record.sequence,
            variables,
            disabled: record.flags.disabled,
        }
    }

    /// The post filter: whether this record should reach backends.
    ///
    /// Single-party records that never reached ANSWERED are suppressed
    /// unless the `unanswered` option is on; DISABLE-flagged records never
    /// post. CONGESTION's code sorts above ANSWERED, so congestion records
    /// always pass.
    pub fn should_post(&self, settings: &GeneralConfig) -> bool {
        if self.disabled {
            return false;
        }
        if !settings.unanswered
            && self.disposition.code() < Disposition::Answered.code()
            && (self.channel.is_empty() || self.dstchannel.is_empty())
        {
            return false;
        }
        true
    }

    /// CSV header matching [`ExternalRecord::to_csv_line`].
    pub fn csv_header() -> &'static str {
        "accountcode,src,dst,dcontext,clid,channel,dstchannel,lastapp,lastdata,start,answer,end,duration,billsec,disposition,amaflags,uniqueid,linkedid,userfield,sequence"
    }

    /// Render as one classic CSV billing line.
    pub fn to_csv_line(&self) -> String {
        let fields = vec![
            self.accountcode.clone(),
            self.src.clone(),
            self.dst.clone(),
            self.dcontext.clone(),
            self.clid.clone(),
            self.channel.clone(),
            self.dstchannel.clone(),
            self.lastapp.clone(),
            self.lastdata.clone(),
            csv_time(self.start),
            csv_time(self.answer),
            csv_time(self.end),
            self.duration.to_string(),
            self.billsec.to_string(),
            self.disposition.to_string(),
            self.amaflags.to_string(),
            self.uniqueid.clone(),
            self.linkedid.clone(),
            self.userfield.clone(),
            self.sequence.to_string(),
        ];

        fields
            .into_iter()
            .map(|f| {
                if f.contains(',') || f.contains('"') || f.contains('\n') {
                    format!("\"{}\"", f.replace('"', "\"\""))
                } else {
                    f
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn csv_time(when: Option<DateTime<Utc>>) -> String {
    when.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}
