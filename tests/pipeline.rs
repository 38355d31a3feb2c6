use netlearner::config::{GanConfig, GanData, MergerConfig};
use netlearner::datasets::{load_csv_matrix, load_schema, load_table, resolve_schema};
use netlearner::features::FeaturePlan;
use netlearner::metrics::{CsvSink, MemorySink};
use netlearner::{FeatureMerger, NetError, RunDir, TrainSchedule, VanillaGan};
use std::fmt::Write as _;
use std::path::Path;

const SERVICES: [&str; 5] = ["-", "dns", "ftp", "http", "smtp"];

fn states() -> Vec<String> {
    (0..50).map(|i| format!("S{i:02}")).collect()
}

fn write_schema(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("schema.csv");
    let mut text = String::from("name,kind,values\n");
    text.push_str("proto,symbolic,tcp;udp\n");
    writeln!(text, "service,symbolic,{}", SERVICES.join(";")).unwrap();
    writeln!(text, "state,symbolic,{}", states().join(";")).unwrap();
    text.push_str("ttl,integer,0:9\nbytes,integer,0:19999\n");
    text.push_str("dur,continuous,\nrate,continuous,\nload,continuous,\n");
    std::fs::write(&path, text).unwrap();
    path
}

/// Rows where the label follows the protocol, so the classifier has
/// something learnable.
fn write_table(dir: &Path, name: &str, rows: usize, odd_proto: Option<&str>) -> std::path::PathBuf {
    let path = dir.join(name);
    let states = states();
    let mut text = String::from("proto,service,state,ttl,bytes,dur,rate,load,attack_cat,label\n");
    for i in 0..rows {
        let attack = i % 2 == 1;
        let proto = match odd_proto {
            Some(p) if i == rows - 1 => p,
            _ if attack => "udp",
            _ => "tcp",
        };
        writeln!(
            text,
            "{},{},{},{},{},{:.3},{:.1},{:.2},{},{}",
            proto,
            SERVICES[i % SERVICES.len()],
            states[i % states.len()],
            i % 10,
            (i * 397) % 20_000,
            i as f64 * 0.01,
            (i % 7) as f64 * 10.0,
            (i % 3) as f64,
            if attack { "Exploits" } else { "Normal" },
            attack as u8
        )
        .unwrap();
    }
    std::fs::write(&path, text).unwrap();
    path
}

fn merger_config(dir: &Path) -> MergerConfig {
    MergerConfig {
        train_path: dir.join("train.csv"),
        test_path: Some(dir.join("test.csv")),
        schema_path: dir.join("schema.csv"),
        hidden_width: 16,
        wide_width: 32,
        batch_size: 8,
        epochs: 3,
        model_path: None,
        ..MergerConfig::default()
    }
}

#[test]
fn test_merger_pipeline_from_csv_files() {
    let dir = tempfile::tempdir().unwrap();
    let schema = load_schema(write_schema(dir.path())).unwrap();
    let train = load_table(write_table(dir.path(), "train.csv", 64, None), &["attack_cat"]).unwrap();
    let test = load_table(write_table(dir.path(), "test.csv", 20, None), &["attack_cat"]).unwrap();
    assert!(train.column("attack_cat").is_err());

    let plan = FeaturePlan::new(resolve_schema(&schema, &[&train, &test]).unwrap()).unwrap();
    assert_eq!(plan.merged_width(), 18);

    let config = merger_config(dir.path());
    let fitted = plan.fit(&train).unwrap();
    let encoded = fitted.encode(&train).unwrap();
    let labels = train.labels("label").unwrap();
    let mut model = FeatureMerger::new(fitted, &config).unwrap();
    assert_eq!(model.merged_width(), 18);

    let stats = model.train(&encoded, &labels).unwrap();
    assert_eq!(stats.len(), 3);
    assert!(stats.iter().all(|s| s.loss.is_finite()));

    let test_encoded = model.plan().encode(&test).unwrap();
    let probs = model.predict(&test_encoded).unwrap();
    assert_eq!(probs.len(), 20);
    assert!(probs.iter().all(|&p| (0.0..=1.0).contains(&p)));
    let accuracy = model.evaluate(&test_encoded, &test.labels("label").unwrap()).unwrap();
    assert!((0.0..=1.0).contains(&accuracy));

    let model_path = dir.path().join("models").join("kmerger.nlm");
    model.save(&model_path).unwrap();
    let reloaded = FeatureMerger::load(&model_path).unwrap();
    let again = reloaded.predict(&test_encoded).unwrap();
    for (a, b) in probs.iter().zip(&again) {
        assert!((a - b).abs() < 1e-9);
    }
}

#[test]
fn test_unseen_category_in_test_split_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let schema = load_schema(write_schema(dir.path())).unwrap();
    let train = load_table(write_table(dir.path(), "train.csv", 16, None), &["attack_cat"]).unwrap();
    let test = load_table(write_table(dir.path(), "test.csv", 4, Some("icmp")), &["attack_cat"]).unwrap();
    let plan = FeaturePlan::new(resolve_schema(&schema, &[&train]).unwrap()).unwrap();
    let fitted = plan.fit(&train).unwrap();
    match fitted.encode(&test) {
        Err(NetError::UnknownCategory { column, value }) => {
            assert_eq!(column, "proto");
            assert_eq!(value, "icmp");
        }
        other => panic!("expected unknown category, got {other:?}"),
    }
}

fn gan_config(dir: &Path) -> GanConfig {
    GanConfig {
        data: GanData::Csv(dir.join("samples.csv")),
        noise_dim: 3,
        input_dim: 4,
        g_hidden: 5,
        d_hidden: 5,
        batch_size: 6,
        num_steps: 30,
        seed: 7,
        output_dir: dir.to_path_buf(),
        ..GanConfig::default()
    }
}

fn run_gan(config: &GanConfig, data: &netlearner::Matrix) -> (VanillaGan, netlearner::gan::TrainingReport) {
    let run = RunDir::create(&config.output_dir, &config.name).unwrap();
    let mut sink = MemorySink::default();
    let mut gan = VanillaGan::new(config).unwrap();
    let report = gan.train(data, TrainSchedule::from(config), &run, &mut sink).unwrap();
    (gan, report)
}

#[test]
fn test_gan_runs_are_reproducible_for_a_seed() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("samples.csv"),
        "0.0,0.5,1.0,0.5\n1.0,0.5,0.0,0.5\n0.2,0.4,0.6,0.8\n0.9,0.1,0.9,0.1\n",
    )
    .unwrap();
    let config = gan_config(dir.path());
    let data = load_csv_matrix(dir.path().join("samples.csv"), false).unwrap();
    assert_eq!(data.len(), 4);

    let (first, report_a) = run_gan(&GanConfig { output_dir: dir.path().join("a"), ..config.clone() }, &data);
    let (second, report_b) = run_gan(&GanConfig { output_dir: dir.path().join("b"), ..config.clone() }, &data);
    assert_eq!(first.generator(), second.generator());
    assert_eq!(first.discriminator(), second.discriminator());
    assert_eq!(report_a.history.points(), report_b.history.points());
    assert_eq!(report_a.final_d_value, report_b.final_d_value);

    let (other, _) = run_gan(
        &GanConfig { seed: 8, output_dir: dir.path().join("c"), ..config },
        &data,
    );
    assert_ne!(first.generator(), other.generator());
}

#[test]
fn test_gan_rejects_mismatched_sample_width() {
    let dir = tempfile::tempdir().unwrap();
    let config = gan_config(dir.path());
    let run = RunDir::create(dir.path(), "VanillaGAN").unwrap();
    let mut sink = CsvSink::create(run.join("metrics.csv")).unwrap();
    let mut gan = VanillaGan::new(&config).unwrap();
    let err = gan
        .train(&vec![vec![0.5; 3]; 4], TrainSchedule::from(&config), &run, &mut sink)
        .unwrap_err();
    assert!(matches!(err, NetError::ShapeMismatch { .. }));
}
