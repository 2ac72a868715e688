//! Nanopore Variant Calling
//!
//! Maps reads with minimap2, calls small variants with clair3 and
//! structural variants with sniffles, filters both with bcftools and
//! computes coverage with mosdepth and bamCoverage.
//!
//! ```text
//! *.fastq.gz ─ run_mapping ─┬─ run_clair3 ── filter_variants ─────────┐
//!                           ├─ run_sniffles ─┬─ merge_sniffles_variants ┤
//!                           │                └─ merge_sniffles          │
//!                           ├─ mosdepth ────────────────────────────────┤
//!                           └─ run_bamcoverage ─────────────────────────┴─ full
//! ```
//!
//! Reads are `<sample>.fastq.gz` or `<sample>.fastq.1.gz` in the data
//! directory, which is taken relative to the working directory.

use std::path::Path;
use std::time::Duration;

use log::warn;

use crate::config::PipelineConfig;
use crate::error::DefinitionError;
use crate::execution::action::{Binding, CommandAction};
use crate::workflow::{Aggregation, OutputRule, TaskDefinition, TaskRegistry};

/// Target that brings every per-sample result up to date.
pub const DEFAULT_TARGET: &str = "full";

const HOURS: u64 = 60 * 60;

/// Mapped, sorted and indexed reads.
const MAPPED_BAM: &str = r"mapped\.dir/([^/]+)_sorted\.bam";

const CLAIR_VCF: &str = r"Clair\.dir/([^/]+)/full_alignment\.vcf\.gz";
const SNIFFLES_SNF: &str = r"Sniffles\.dir/([^/]+)/output\.snf";
const SNIFFLES_VCF: &str = r"Sniffles\.dir/([^/]+)/output\.vcf";

/// Regex matching the reads inside `data_dir`.
pub fn reads_pattern(data_dir: &Path) -> String {
    let dir = data_dir.to_string_lossy();
    let dir = dir.trim_end_matches('/');
    let prefix = if dir.is_empty() || dir == "." {
        String::new()
    } else {
        format!("{}/", regex::escape(dir.trim_start_matches("./")))
    };
    format!(r"{}([^/]+)\.fastq(?:\.1)?\.gz", prefix)
}

/// Builds the registry of the variant-calling tasks.
pub fn registry(config: &PipelineConfig) -> Result<TaskRegistry, DefinitionError> {
    let data_dir = config.data_dir();
    if data_dir.is_absolute() {
        warn!(
            "Data directory {} is absolute; reads are only found below the working directory",
            data_dir.display()
        );
    }

    let reference = config.reference_fasta.clone();
    let threads = config.threads.max(1);
    let mut registry = TaskRegistry::new();

    let minimap2_options = config.minimap2_options.clone();
    let mapping_reference = reference.clone();
    registry.register(
        TaskDefinition::builder("run_mapping")
            .input_regex(&reads_pattern(&data_dir))
            .output(OutputRule::template(r"mapped.dir/\1_sorted.bam"))
            .action(CommandAction::new(move |b: &Binding| {
                let output = b.output();
                let sam = output.replace("_sorted.bam", ".sam");
                let bam = output.replace("_sorted.bam", ".bam");
                Ok(format!(
                    "minimap2 -t {threads} {options} {reference} {input} > {sam} && \
                     samtools view -S -b {sam} > {bam} && \
                     samtools sort {bam} -o {output} && \
                     samtools index {output}",
                    threads = b.hints.threads,
                    options = minimap2_options,
                    reference = mapping_reference,
                    input = b.input(),
                ))
            }))
            .threads(threads)
            .wall_time(Duration::from_secs(24 * HOURS))
            .build()?,
    )?;

    let clair_model = config.clair_model.clone();
    let clair_reference = reference.clone();
    registry.register(
        TaskDefinition::builder("run_clair3")
            .from_tasks(&["run_mapping"], Some(MAPPED_BAM))
            .output(OutputRule::template(r"Clair.dir/\1/full_alignment.vcf.gz"))
            .action(CommandAction::new(move |b: &Binding| {
                let output = b.output();
                let outdir = parent_dir(&output)?;
                Ok(format!(
                    "run_clair3.sh --bam_fn={input} --ref_fn={reference} --threads={threads} \
                     --platform=\"ont\" --model_path={model} --output={outdir} && touch {output}",
                    input = b.input(),
                    reference = clair_reference,
                    threads = b.hints.threads,
                    model = clair_model,
                ))
            }))
            .threads(threads)
            .queue(config.cluster.gpu_queue.clone())
            .wall_time(Duration::from_secs(24 * HOURS))
            .build()?,
    )?;

    let snv_expression = config.filter.snv_expression.clone();
    registry.register(
        TaskDefinition::builder("filter_variants")
            .from_tasks(&["run_clair3"], Some(CLAIR_VCF))
            .output(OutputRule::template(
                r"filtered_vcf.dir/\1_Qual30_full_alignment.vcf.gz",
            ))
            .action(CommandAction::new(move |b: &Binding| {
                Ok(bcftools_filter(&snv_expression, b))
            }))
            .wall_time(Duration::from_secs(24 * HOURS))
            .build()?,
    )?;

    let sniffles_reference = reference;
    registry.register(
        TaskDefinition::builder("run_sniffles")
            .from_tasks(&["run_mapping"], Some(MAPPED_BAM))
            .output(OutputRule::Template(vec![
                r"Sniffles.dir/\1/output.snf".to_string(),
                r"Sniffles.dir/\1/output.vcf".to_string(),
            ]))
            .action(CommandAction::new(move |b: &Binding| {
                let snf = b.output();
                let vcf = b
                    .outputs
                    .get(1)
                    .map(|p| p.display().to_string())
                    .ok_or_else(|| format!("'{}' has no vcf output", b.label))?;
                Ok(format!(
                    "sniffles -i {input} --vcf {vcf} --snf {snf} --reference {reference} 2> {snf}.log",
                    input = b.input(),
                    reference = sniffles_reference,
                ))
            }))
            .wall_time(Duration::from_secs(48 * HOURS))
            .build()?,
    )?;

    registry.register(
        TaskDefinition::builder("merge_sniffles")
            .from_tasks(&["run_sniffles"], Some(SNIFFLES_SNF))
            .aggregation(Aggregation::ManyToOne)
            .output(OutputRule::fixed("Sniffles.dir/merged.vcf.gz"))
            .action(CommandAction::new(|b: &Binding| {
                Ok(format!(
                    "sniffles --input {} --vcf {}",
                    b.inputs_joined(),
                    b.output()
                ))
            }))
            .build()?,
    )?;

    let sv_expression = config.filter.sv_expression.clone();
    registry.register(
        TaskDefinition::builder("merge_sniffles_variants")
            .from_tasks(&["run_sniffles"], Some(SNIFFLES_VCF))
            .output(OutputRule::template(
                r"filtered_vcf.dir/\1_sniffles_Qual30_output.vcf.gz",
            ))
            .action(CommandAction::new(move |b: &Binding| {
                Ok(bcftools_filter(&sv_expression, b))
            }))
            .build()?,
    )?;

    registry.register(
        TaskDefinition::builder("mosdepth")
            .from_tasks(&["run_mapping"], Some(MAPPED_BAM))
            .output(OutputRule::template(r"coverage.dir/\1.mosdepth.summary.txt"))
            .action(CommandAction::new(|b: &Binding| {
                let output = b.output();
                let prefix = output.trim_end_matches(".mosdepth.summary.txt");
                Ok(format!("mosdepth {} {}", prefix, b.input()))
            }))
            .wall_time(Duration::from_secs(24 * HOURS))
            .build()?,
    )?;

    registry.register(
        TaskDefinition::builder("run_bamcoverage")
            .from_tasks(&["run_mapping"], Some(MAPPED_BAM))
            .output(OutputRule::template(r"mapped.dir/\1.bw"))
            .action(CommandAction::new(|b: &Binding| {
                Ok(format!("bamCoverage -b {} -o {}", b.input(), b.output()))
            }))
            .wall_time(Duration::from_secs(24 * HOURS))
            .build()?,
    )?;

    registry.register(
        TaskDefinition::builder(DEFAULT_TARGET)
            .after("mosdepth")
            .after("merge_sniffles_variants")
            .after("filter_variants")
            .after("run_bamcoverage")
            .build()?,
    )?;

    Ok(registry)
}

fn bcftools_filter(expression: &str, binding: &Binding) -> String {
    format!(
        "bcftools filter -O z -o {} -i \"{}\" {}",
        binding.output(),
        expression,
        binding.input()
    )
}

fn parent_dir(path: &str) -> Result<String, String> {
    Path::new(path)
        .parent()
        .map(|p| p.display().to_string())
        .ok_or_else(|| format!("{} has no parent directory", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataLocation;
    use crate::execution::action::Runnable;
    use crate::workflow::{Dag, GraphBuilder, MemorySource, Snapshot, TaskInstance};
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn build(config: &PipelineConfig, files: &[&str]) -> Dag {
        let source = MemorySource::new();
        for file in files {
            source.add(*file, SystemTime::now());
        }
        let snapshot = Snapshot::capture(&source).unwrap();
        let registry = registry(config).unwrap();
        GraphBuilder::new(&registry, &snapshot).build().unwrap()
    }

    fn command(instance: &TaskInstance) -> String {
        match instance.action.prepare(&instance.binding()).unwrap() {
            Runnable::Command(command) => command,
            other => panic!("expected a command, got {:?}", other),
        }
    }

    #[test]
    fn test_reads_pattern() {
        assert_eq!(
            reads_pattern(Path::new(".")),
            r"([^/]+)\.fastq(?:\.1)?\.gz"
        );
        assert_eq!(
            reads_pattern(Path::new("data.dir")),
            r"data\.dir/([^/]+)\.fastq(?:\.1)?\.gz"
        );
        assert_eq!(
            reads_pattern(Path::new("./reads/")),
            r"reads/([^/]+)\.fastq(?:\.1)?\.gz"
        );
    }

    #[test]
    fn test_registry_order() {
        let registry = registry(&PipelineConfig::default()).unwrap();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(
            names,
            vec![
                "run_mapping",
                "run_clair3",
                "filter_variants",
                "run_sniffles",
                "merge_sniffles",
                "merge_sniffles_variants",
                "mosdepth",
                "run_bamcoverage",
                "full",
            ]
        );
    }

    #[test]
    fn test_graph_for_two_samples() {
        let dag = build(
            &PipelineConfig::default(),
            &["s1.fastq.gz", "s2.fastq.1.gz", "notes.txt"],
        );

        // 7 per-sample tasks, one merge, one target
        assert_eq!(dag.len(), 2 * 7 + 2);
        assert_eq!(dag.instances_of("run_mapping").len(), 2);

        let mapping = dag.find("run_mapping[s2]").unwrap();
        assert_eq!(mapping.inputs, vec![PathBuf::from("s2.fastq.1.gz")]);
        assert_eq!(mapping.outputs, vec![PathBuf::from("mapped.dir/s2_sorted.bam")]);

        let merge = &dag.instances()[dag.instances_of("merge_sniffles")[0]];
        assert_eq!(
            merge.inputs,
            vec![
                PathBuf::from("Sniffles.dir/s1/output.snf"),
                PathBuf::from("Sniffles.dir/s2/output.snf"),
            ]
        );
        assert_eq!(merge.predecessors.len(), 2);

        let filtered = dag.find("merge_sniffles_variants[s1]").unwrap();
        assert_eq!(filtered.inputs, vec![PathBuf::from("Sniffles.dir/s1/output.vcf")]);
    }

    #[test]
    fn test_full_target_excludes_merge() {
        let dag = build(&PipelineConfig::default(), &["s1.fastq.gz", "s2.fastq.gz"]);
        let selected = dag.select_targets(&["full"]).unwrap();

        assert_eq!(selected.len(), dag.len() - 1);
        assert!(selected.instances_of("merge_sniffles").is_empty());

        let full = &selected.instances()[selected.instances_of("full")[0]];
        // mosdepth, merge_sniffles_variants, filter_variants, run_bamcoverage per sample
        assert_eq!(full.predecessors.len(), 8);
    }

    #[test]
    fn test_data_dir_prefix() {
        let config = PipelineConfig {
            data: DataLocation::Index(1),
            ..PipelineConfig::default()
        };
        let dag = build(&config, &["data.dir/s1.fastq.gz", "s9.fastq.gz"]);

        assert_eq!(dag.instances_of("run_mapping").len(), 1);
        assert!(dag.find("run_mapping[s1]").is_some());
    }

    #[test]
    fn test_no_reads_leaves_only_target() {
        let dag = build(&PipelineConfig::default(), &[]);
        assert_eq!(dag.len(), 1);
        assert!(dag.find("full").is_some());
    }

    #[test]
    fn test_commands() {
        let mut config = PipelineConfig::default();
        config.reference_fasta = "ref.fa".into();
        config.clair_model = "/models/ont".into();
        let dag = build(&config, &["s1.fastq.gz"]);

        let mapping = dag.find("run_mapping[s1]").unwrap();
        assert_eq!(mapping.hints.threads, 4);
        let cmd = command(mapping);
        assert!(cmd.starts_with("minimap2 -t 4 -ax map-ont ref.fa s1.fastq.gz > mapped.dir/s1.sam"));
        assert!(cmd.contains("samtools sort mapped.dir/s1.bam -o mapped.dir/s1_sorted.bam"));
        assert!(cmd.ends_with("samtools index mapped.dir/s1_sorted.bam"));

        let clair = dag.find("run_clair3[s1]").unwrap();
        assert_eq!(clair.hints.queue.as_deref(), Some("gpu"));
        let cmd = command(clair);
        assert!(cmd.contains("--model_path=/models/ont"));
        assert!(cmd.contains("--output=Clair.dir/s1 "));
        assert!(cmd.ends_with("touch Clair.dir/s1/full_alignment.vcf.gz"));

        assert_eq!(
            command(dag.find("filter_variants[s1]").unwrap()),
            "bcftools filter -O z -o filtered_vcf.dir/s1_Qual30_full_alignment.vcf.gz \
             -i \"QUAL>20 & DP>20\" Clair.dir/s1/full_alignment.vcf.gz"
        );

        let sniffles = dag.find("run_sniffles[s1]").unwrap();
        assert_eq!(sniffles.hints.wall_time, Some(Duration::from_secs(48 * HOURS)));
        assert_eq!(
            command(sniffles),
            "sniffles -i mapped.dir/s1_sorted.bam --vcf Sniffles.dir/s1/output.vcf \
             --snf Sniffles.dir/s1/output.snf --reference ref.fa 2> Sniffles.dir/s1/output.snf.log"
        );

        assert_eq!(
            command(dag.find("mosdepth[s1]").unwrap()),
            "mosdepth coverage.dir/s1 mapped.dir/s1_sorted.bam"
        );
        assert_eq!(
            command(dag.find("run_bamcoverage[s1]").unwrap()),
            "bamCoverage -b mapped.dir/s1_sorted.bam -o mapped.dir/s1.bw"
        );
        assert!(dag.find("full").unwrap().action.is_noop());
    }

    #[test]
    fn test_filter_expressions_from_config() {
        let mut config = PipelineConfig::default();
        config.filter.sv_expression = "QUAL>50".into();
        let dag = build(&config, &["s1.fastq.gz"]);

        let cmd = command(dag.find("merge_sniffles_variants[s1]").unwrap());
        assert!(cmd.contains("-i \"QUAL>50\""));
        assert!(cmd.ends_with("Sniffles.dir/s1/output.vcf"));
    }
}
