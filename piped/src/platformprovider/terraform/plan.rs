use crate::errors::PipedError;
use crate::regexpool::default_pool;

const PLAN_HAS_CHANGES: &str =
    r"(?m)^Plan: (?:(\d+) to import, )?(\d+) to add, (\d+) to change, (\d+) to destroy\.$";
const PLAN_NO_CHANGES: &str =
    r"(?m)^No changes\. (?:Infrastructure is up-to-date|Your infrastructure matches the configuration)\.$";
const ANSI: &str = r"[\x1B\x{9B}][\[\]()#;?]*(?:(?:(?:[a-zA-Z\d]*(?:;[a-zA-Z\d]*)*)?\x07)|(?:(?:\d{1,4}(?:;\d{0,4})*)?[\dA-PRZcf-ntqry=><~]))";

const DIFF_START: &str = "Terraform will perform the following actions:";
const DIFF_END: char = '─';

/// Counts parsed from the summary line of `terraform plan`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanResult {
    pub imports: u32,
    pub adds: u32,
    pub changes: u32,
    pub destroys: u32,

    pub plan_output: String,
}

impl PlanResult {
    pub fn no_changes(&self) -> bool {
        self.imports == 0 && self.adds == 0 && self.changes == 0 && self.destroys == 0
    }

    pub fn summary(&self) -> String {
        if self.imports > 0 {
            format!(
                "{} to import, {} to add, {} to change, {} to destroy",
                self.imports, self.adds, self.changes, self.destroys
            )
        } else {
            format!("{} to add, {} to change, {} to destroy", self.adds, self.changes, self.destroys)
        }
    }

    /// The action list of the plan output with every sign moved to the first
    /// column, so the text reads like a unified diff.
    pub fn render(&self) -> String {
        let out = &self.plan_output;
        let start = out.find(DIFF_START).map(|i| i + DIFF_START.len()).unwrap_or(0);
        let end = out[start..].find(DIFF_END).map(|i| start + i).unwrap_or(out.len());

        let mut rendered = String::new();
        let mut curly: Vec<char> = Vec::new();
        let mut square: Vec<char> = Vec::new();

        for line in out[start..end].lines() {
            if line.is_empty() {
                continue;
            }
            let mut r: Vec<char> = line.chars().collect();
            let tail = r[r.len() - 1];

            // The outermost block carries no sign.
            if tail == '{' && curly.is_empty() {
                if let Some(deadline) = find_chars(&r, "resource") {
                    r[..deadline].iter_mut().for_each(|c| *c = ' ');
                }
            }

            let Some(pos) = r.iter().position(|c| *c != ' ' && *c != '\t') else {
                continue;
            };
            let head = r[pos];
            if matches!(head, '+' | '-' | '~') {
                r.swap(0, pos);
            }

            if tail == '{' {
                curly.push(r[0]);
            }
            if head == '}' {
                r[0] = curly.pop().unwrap_or(r[0]);
            }
            if tail == '[' {
                square.push(r[0]);
            }
            if head == ']' {
                r[0] = square.pop().unwrap_or(r[0]);
            }

            rendered.extend(r);
            rendered.push('\n');
        }
        rendered
    }
}

fn find_chars(haystack: &[char], needle: &str) -> Option<usize> {
    let needle: Vec<char> = needle.chars().collect();
    haystack.windows(needle.len()).position(|w| w == needle.as_slice())
}

pub fn strip_ansi_codes(s: &str) -> Result<String, PipedError> {
    Ok(default_pool().get(ANSI)?.replace_all(s, "").into_owned())
}

/// Parse the output of `terraform plan` that exited with changes
pub fn parse_plan_result(out: &str, ansi_included: bool) -> Result<PlanResult, PipedError> {
    let out = if ansi_included {
        strip_ansi_codes(out)?
    } else {
        out.to_string()
    };

    if let Some(caps) = default_pool().get(PLAN_HAS_CHANGES)?.captures(&out) {
        let num = |i: usize| -> Option<u32> {
            match caps.get(i) {
                Some(m) => m.as_str().parse().ok(),
                None => Some(0),
            }
        };
        if let (Some(imports), Some(adds), Some(changes), Some(destroys)) = (num(1), num(2), num(3), num(4)) {
            return Ok(PlanResult {
                imports,
                adds,
                changes,
                destroys,
                plan_output: out.clone(),
            });
        }
    }

    if default_pool().get(PLAN_NO_CHANGES)?.is_match(&out) {
        return Ok(PlanResult::default());
    }

    Err(PipedError::Internal("unable to parse plan output".to_string()))
}
