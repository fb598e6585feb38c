//! Parsers for grid-engine command output (`qstat -xml`, `qsub`).

use hpgrid_core::TrialId;
use regex::Regex;

/// One `<job_list>` entry of `qstat -xml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QstatRecord {
    pub job_id: String,
    pub state: String,
    pub name: String,
}

impl QstatRecord {
    /// Trial id encoded as the trailing number of the job name (`run_000007.sh`).
    pub fn trial_id(&self) -> Option<TrialId> {
        let digits: String = self
            .name
            .trim_end_matches(|c: char| !c.is_ascii_digit())
            .chars()
            .rev()
            .take_while(char::is_ascii_digit)
            .collect();
        digits.chars().rev().collect::<String>().parse().ok()
    }
}

/// Compiled patterns for grid-engine output.
#[derive(Debug, Clone)]
pub struct QstatParser {
    job_list: Regex,
    job_number: Regex,
    state: Regex,
    name: Regex,
    submitted: Regex,
}

impl QstatParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            job_list: Regex::new(r"(?s)<job_list[^>]*>(.*?)</job_list>")?,
            job_number: Regex::new(r"<JB_job_number>\s*([^<\s]+)\s*</JB_job_number>")?,
            state: Regex::new(r"<state>\s*([^<]*?)\s*</state>")?,
            name: Regex::new(r"<JB_name>\s*([^<]*?)\s*</JB_name>")?,
            submitted: Regex::new(r"(?i)your job(?:-array)?\s+(\d+)")?,
        })
    }

    /// Parse every job record; entries without a job number are skipped.
    pub fn parse_jobs(&self, xml: &str) -> Vec<QstatRecord> {
        self.job_list
            .captures_iter(xml)
            .filter_map(|caps| {
                let body = caps.get(1)?.as_str();
                let field = |re: &Regex| {
                    re.captures(body)
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().to_string())
                };
                Some(QstatRecord {
                    job_id: field(&self.job_number)?,
                    state: field(&self.state).unwrap_or_default(),
                    name: field(&self.name).unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Job id announced by the submit command ("Your job 12345 (...) has been submitted").
    pub fn parse_submitted(&self, output: &str) -> Option<String> {
        self.submitted
            .captures(output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QSTAT_XML: &str = r#"<?xml version='1.0'?>
<job_info  xmlns:xsd="http://arc.liv.ac.uk/repos/darcs/sge/source/dist/util/resources/schemas/qstat/qstat.xsd">
  <queue_info>
    <job_list state="running">
      <JB_job_number>6001</JB_job_number>
      <JAT_prio>0.25586</JAT_prio>
      <JB_name>run_000003.sh</JB_name>
      <JB_owner>user</JB_owner>
      <state>r</state>
      <queue_name>gpu@g0001</queue_name>
      <slots>80</slots>
    </job_list>
  </queue_info>
  <job_info>
    <job_list state="pending">
      <JB_job_number>6002</JB_job_number>
      <JB_name>run_000012.sh</JB_name>
      <state>qw</state>
    </job_list>
    <job_list state="pending">
      <JB_name>broken</JB_name>
    </job_list>
  </job_info>
</job_info>
"#;

    #[test]
    fn parses_job_list_records() {
        let parser = QstatParser::new().unwrap();
        let jobs = parser.parse_jobs(QSTAT_XML);
        assert_eq!(jobs.len(), 2);
        assert_eq!(
            jobs[0],
            QstatRecord {
                job_id: "6001".into(),
                state: "r".into(),
                name: "run_000003.sh".into(),
            }
        );
        assert_eq!(jobs[0].trial_id(), Some(3));
        assert_eq!(jobs[1].state, "qw");
        assert_eq!(jobs[1].trial_id(), Some(12));
    }

    #[test]
    fn empty_output_has_no_jobs() {
        let parser = QstatParser::new().unwrap();
        assert!(parser.parse_jobs("").is_empty());
        assert!(parser
            .parse_jobs("<job_info><queue_info></queue_info></job_info>")
            .is_empty());
    }

    #[test]
    fn trial_id_from_name() {
        let record = |name: &str| QstatRecord {
            job_id: "1".into(),
            state: "r".into(),
            name: name.into(),
        };
        assert_eq!(record("run_000042.sh").trial_id(), Some(42));
        assert_eq!(record("run_7").trial_id(), Some(7));
        assert_eq!(record("train").trial_id(), None);
    }

    #[test]
    fn submit_output_job_id() {
        let parser = QstatParser::new().unwrap();
        assert_eq!(
            parser
                .parse_submitted("Your job 123456 (\"run_000001.sh\") has been submitted")
                .as_deref(),
            Some("123456")
        );
        assert_eq!(parser.parse_submitted("error: no such group"), None);
    }
}
