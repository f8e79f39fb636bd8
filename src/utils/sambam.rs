use anyhow::{anyhow, Result};
use crate::config::defs::SAM_UNMAPPED_FLAG;

pub const SAM_HEADER_MARKER: char = '@';
const SAM_MANDATORY_FIELDS: usize = 11;
const FLAG_COLUMN: usize = 1;
const MAPQ_COLUMN: usize = 4;


pub fn is_header_line(line: &str) -> bool {
    line.starts_with(SAM_HEADER_MARKER)
}

pub fn is_unmapped(flag: u16) -> bool {
    flag & SAM_UNMAPPED_FLAG != 0
}


/// A borrowed, tab-split SAM alignment line.
#[derive(Debug)]
pub struct SamLine<'a> {
    fields: Vec<&'a str>,
}

impl<'a> SamLine<'a> {
    /// Splits an alignment line (without its line terminator) into columns.
    pub fn parse(line: &'a str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < SAM_MANDATORY_FIELDS {
            return Err(anyhow!(
                "expected at least {} tab-separated columns, found {}",
                SAM_MANDATORY_FIELDS,
                fields.len()
            ));
        }
        Ok(SamLine { fields })
    }

    pub fn qname(&self) -> &'a str {
        self.fields[0]
    }

    pub fn flag(&self) -> Result<u16> {
        self.fields[FLAG_COLUMN]
            .parse()
            .map_err(|e| anyhow!("invalid FLAG '{}': {}", self.fields[FLAG_COLUMN], e))
    }

    pub fn mapq(&self) -> Result<i64> {
        self.fields[MAPQ_COLUMN]
            .parse()
            .map_err(|e| anyhow!("invalid MAPQ '{}': {}", self.fields[MAPQ_COLUMN], e))
    }

    /// Optional `TAG:TYPE:VALUE` columns after the eleven mandatory ones.
    pub fn tags(&self) -> &[&'a str] {
        &self.fields[SAM_MANDATORY_FIELDS..]
    }

    /// Re-joins the columns with the MAPQ column replaced.
    pub fn with_mapq(&self, mapq: i64) -> String {
        let mapq = mapq.to_string();
        let mut out = String::with_capacity(self.fields.iter().map(|f| f.len() + 1).sum::<usize>() + mapq.len());
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push('\t');
            }
            if i == MAPQ_COLUMN {
                out.push_str(&mapq);
            } else {
                out.push_str(field);
            }
        }
        out
    }
}
