use crate::index::search_index::SearchIndex;
use crate::index::types::Generation;
use crate::index::writer::generation_dir;
use crate::utils::dir_size;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Snapshot of one generation for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub generation: Generation,
    pub organizations: u64,
    pub terms: u64,
    pub built_at: i64,
    pub source_job: Option<String>,
    pub disk_bytes: Option<u64>,
    /// (code, description, count)
    pub categories: Vec<(String, String, u64)>,
    /// Largest states first
    pub states: Vec<(String, u64)>,
}

impl IndexStats {
    pub fn collect(index: &SearchIndex, generations: &Path) -> Self {
        let disk_bytes = if index.generation() == 0 {
            None
        } else {
            dir_size(&generation_dir(generations, index.generation())).ok()
        };

        Self {
            generation: index.generation(),
            organizations: index.len() as u64,
            terms: index.term_count() as u64,
            built_at: index.meta().built_at,
            source_job: index.meta().source_job.clone(),
            disk_bytes,
            categories: index
                .category_counts()
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(c, count)| (c.code().to_string(), c.description().to_string(), count))
                .collect(),
            states: index.state_counts(),
        }
    }
}

/// Display index statistics
pub fn print_stats(stats: &IndexStats) {
    println!("Index Statistics");
    println!("================");
    println!();
    println!("Generation:       {}", stats.generation);
    println!("Organizations:    {}", stats.organizations);
    println!("Terms:            {}", stats.terms);
    if let Some(job) = &stats.source_job {
        println!("Source job:       {}", job);
    }
    if stats.generation > 0 {
        println!("Built:            {}", format_timestamp(stats.built_at));
    }
    if let Some(size) = stats.disk_bytes {
        println!("Index size:       {}", format_size(size));
    }

    if !stats.categories.is_empty() {
        println!();
        println!("Organizations by category:");
        for (code, description, count) in &stats.categories {
            println!("  {:6} {:52} {}", code, description, count);
        }
    }

    if !stats.states.is_empty() {
        println!();
        println!("Top states:");
        for (state, count) in stats.states.iter().take(15) {
            println!("  {:6} {}", state, count);
        }
        if stats.states.len() > 15 {
            println!("  ... and {} more", stats.states.len() - 15);
        }
    }
}

/// Format byte size to human readable
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format unix timestamp as UTC
pub fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Tokenizer;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
    }

    #[test]
    fn test_stats_of_empty_generation() {
        let stats = IndexStats::collect(&SearchIndex::empty(Tokenizer::default()), Path::new("/nonexistent"));
        assert_eq!(stats.generation, 0);
        assert_eq!(stats.organizations, 0);
        assert!(stats.disk_bytes.is_none());
        assert!(stats.categories.is_empty());
    }
}
