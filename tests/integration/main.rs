//! Integration tests for imgdeps

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// Command isolated from the user's settings, state and cache
    fn imgdeps(home: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("imgdeps");
        cmd.env("XDG_CONFIG_HOME", home.path().join("config"))
            .env("XDG_STATE_HOME", home.path().join("state"))
            .env("XDG_CACHE_HOME", home.path().join("cache"))
            .env("IMGDEPS_CACHE_DIR", home.path().join("layers"))
            .env_remove("IMGDEPS_CONFIG")
            .env_remove("IMGDEPS_REGISTRY")
            .env_remove("IMGDEPS_SHARED_STORE");
        cmd
    }

    fn write_declaration(home: &TempDir, content: &str) -> std::path::PathBuf {
        let path = home.path().join("imgdeps.yaml");
        std::fs::write(&path, content).unwrap();
        path
    }

    const DECLARATION: &str = r#"
image_name: app
layers:
  base: debian:12
  apt: [curl, git]
  config:
    - name: motd
      commands: ["echo hi > /etc/motd"]
"#;

    #[test]
    fn help_displays() {
        let home = TempDir::new().unwrap();
        imgdeps(&home)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("incremental container image layer builder"));
    }

    #[test]
    fn version_displays() {
        let home = TempDir::new().unwrap();
        imgdeps(&home)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("imgdeps"));
    }

    #[test]
    fn init_writes_declaration() {
        let home = TempDir::new().unwrap();
        imgdeps(&home)
            .args(["init", "--path"])
            .arg(home.path())
            .assert()
            .success();
        let content = std::fs::read_to_string(home.path().join("imgdeps.yaml")).unwrap();
        assert!(content.contains("image_name:"));

        imgdeps(&home)
            .args(["init", "--path"])
            .arg(home.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn plan_on_empty_cache_builds_everything() {
        let home = TempDir::new().unwrap();
        let decl = write_declaration(&home, DECLARATION);
        imgdeps(&home)
            .arg("plan")
            .arg(&decl)
            .assert()
            .success()
            .stdout(predicate::str::contains("base:debian:12"))
            .stdout(predicate::str::contains("0 reused, 0 retained, 4 to build"));
    }

    #[test]
    fn plan_as_json() {
        let home = TempDir::new().unwrap();
        let decl = write_declaration(&home, DECLARATION);
        let output = imgdeps(&home)
            .args(["plan", "--format", "json"])
            .arg(&decl)
            .output()
            .unwrap();
        assert!(output.status.success());

        let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(doc["up_to_date"], false);
        assert_eq!(doc["plan"]["target"], "app:latest");
        let steps = doc["plan"]["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 4);
        assert!(steps.iter().all(|s| s["action"] == "build"));
        assert_eq!(steps[3]["logical_id"], "config:motd");
    }

    #[test]
    fn plan_rejects_unknown_layer_category() {
        let home = TempDir::new().unwrap();
        let decl = write_declaration(
            &home,
            "image_name: app\nlayers:\n  base: debian:12\n  pip: [requests]\n",
        );
        imgdeps(&home)
            .arg("plan")
            .arg(&decl)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid build declaration"));
    }

    #[test]
    fn plan_without_declaration_hints_init() {
        let home = TempDir::new().unwrap();
        imgdeps(&home)
            .arg("plan")
            .arg(home.path().join("missing.yaml"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Declaration file not found"))
            .stderr(predicate::str::contains("imgdeps init"));
    }

    #[test]
    fn layers_on_empty_cache() {
        let home = TempDir::new().unwrap();
        imgdeps(&home)
            .arg("layers")
            .assert()
            .success()
            .stdout(predicate::str::contains("The cache is empty"));

        let output = imgdeps(&home)
            .args(["layers", "--format", "json"])
            .output()
            .unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(doc["layers"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn clean_dry_run_on_empty_cache() {
        let home = TempDir::new().unwrap();
        imgdeps(&home)
            .args(["clean", "--dry-run", "--older-than", "7"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing unused"));
    }

    #[test]
    fn export_unknown_tag() {
        let home = TempDir::new().unwrap();
        imgdeps(&home)
            .args(["export", "nope:latest", "--output"])
            .arg(home.path().join("nope.tar"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("No tracked chain for nope:latest"));
    }

    #[test]
    fn completions_generate() {
        let home = TempDir::new().unwrap();
        imgdeps(&home)
            .args(["completions", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("imgdeps"));
    }
}

mod engine_scenarios {
    use async_trait::async_trait;
    use imgdeps::cache::{ChecksumStore, DirectoryTier, EngineTier, TieredCache};
    use imgdeps::config::{Config, PushPolicy};
    use imgdeps::error::{ImgdepsError, ImgdepsResult};
    use imgdeps::hasher::ContentHasher;
    use imgdeps::journal::Journal;
    use imgdeps::layer::{resolve, Declaration};
    use imgdeps::orchestration::{
        BuildFailure, BuildRequest, BuiltImage, ContainerRuntime, ImageBuilder,
    };
    use imgdeps::plan::{BuildOptions, BuildReport, Executor};
    use std::collections::{BTreeMap, HashSet};
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Engine whose image store is a set of refs; archives hold the ref
    #[derive(Default)]
    struct MemoryEngine {
        images: Mutex<HashSet<String>>,
    }

    impl MemoryEngine {
        fn has(&self, image: &str) -> bool {
            self.images.lock().unwrap().contains(image)
        }
    }

    #[async_trait]
    impl ContainerRuntime for MemoryEngine {
        async fn is_available(&self) -> ImgdepsResult<bool> {
            Ok(true)
        }

        async fn image_exists(&self, image: &str) -> ImgdepsResult<bool> {
            Ok(self.has(image))
        }

        async fn pull(&self, image: &str) -> ImgdepsResult<()> {
            Err(ImgdepsError::command_exec("pull", format!("{image}: manifest unknown")))
        }

        async fn build_image(
            &self,
            _context_dir: &Path,
            tag: &str,
            _build_args: &BTreeMap<String, String>,
            _on_output: &(dyn Fn(String) + Send + Sync),
        ) -> ImgdepsResult<()> {
            self.images.lock().unwrap().insert(tag.to_string());
            Ok(())
        }

        async fn save_image(&self, image: &str, archive: &Path) -> ImgdepsResult<()> {
            if !self.has(image) {
                return Err(ImgdepsError::ImageNotFound(image.to_string()));
            }
            std::fs::write(archive, image).map_err(|e| ImgdepsError::io("writing archive", e))
        }

        async fn load_image(&self, archive: &Path) -> ImgdepsResult<()> {
            let image = std::fs::read_to_string(archive)
                .map_err(|e| ImgdepsError::io("reading archive", e))?;
            self.images.lock().unwrap().insert(image);
            Ok(())
        }

        async fn tag_image(&self, _source: &str, target: &str) -> ImgdepsResult<()> {
            self.images.lock().unwrap().insert(target.to_string());
            Ok(())
        }

        async fn push_image(&self, _image: &str) -> ImgdepsResult<()> {
            Ok(())
        }

        async fn remove_image(&self, image: &str) -> ImgdepsResult<()> {
            self.images.lock().unwrap().remove(image);
            Ok(())
        }

        async fn image_size(&self, _image: &str) -> ImgdepsResult<u64> {
            Ok(1024)
        }

        fn runtime_name(&self) -> &'static str {
            "Memory"
        }
    }

    /// Builder that records logical ids and materializes images in the engine
    struct RecordingBuilder {
        engine: Arc<MemoryEngine>,
        built: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ImageBuilder for RecordingBuilder {
        async fn build(&self, request: &BuildRequest) -> Result<BuiltImage, BuildFailure> {
            self.built.lock().unwrap().push(request.layer.logical_id());
            self.engine
                .images
                .lock()
                .unwrap()
                .insert(request.image_ref.clone());
            Ok(BuiltImage {
                image_ref: request.image_ref.clone(),
                size_bytes: 1024,
            })
        }
    }

    struct Machine {
        engine: Arc<MemoryEngine>,
        builder: Arc<RecordingBuilder>,
    }

    impl Machine {
        fn new() -> Self {
            let engine = Arc::new(MemoryEngine::default());
            let builder = Arc::new(RecordingBuilder {
                engine: Arc::clone(&engine),
                built: Mutex::new(Vec::new()),
            });
            Self { engine, builder }
        }

        fn built(&self) -> Vec<String> {
            std::mem::take(&mut *self.builder.built.lock().unwrap())
        }

        async fn build(&self, config: &Config, shared: &Path, yaml: &str) -> BuildReport {
            let engine = Box::new(EngineTier::new(self.engine.clone()));
            let cache = TieredCache::new(engine, config.cache.push)
                .with_tier(Box::new(DirectoryTier::new(shared.to_path_buf(), self.engine.clone())));
            let executor = Executor::new(config, self.builder.clone(), self.engine.clone(), cache)
                .with_journal(Journal::disabled());

            let decl = Declaration::parse(yaml, false).unwrap();
            let resolved = resolve(&decl, Path::new("."), &ContentHasher::default()).unwrap();
            executor
                .run(resolved, BTreeMap::new(), &BuildOptions::default())
                .await
                .unwrap()
        }
    }

    fn config(temp: &TempDir) -> Config {
        let mut config = Config::default();
        config.cache.dir = Some(temp.path().join("cache"));
        config.cache.push = PushPolicy::OnSuccess;
        config.build.backoff_ms = 1;
        config.general.journal = false;
        config
    }

    fn apt(packages: &[&str]) -> String {
        format!(
            "image_name: app\nlayers:\n  base: debian:12\n  apt: [{}]\n",
            packages.join(", ")
        )
    }

    #[tokio::test]
    async fn removing_a_package_keeps_the_prefix() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let shared = temp.path().join("shared");
        let machine = Machine::new();

        let first = machine.build(&config, &shared, &apt(&["curl", "git", "wget", "vim"])).await;
        assert_eq!(first.built, 5);
        machine.built();

        let second = machine.build(&config, &shared, &apt(&["curl", "git", "vim"])).await;
        assert_eq!(second.reused, 3);
        assert_eq!(machine.built(), vec!["apt:vim"]);

        let third = machine.build(&config, &shared, &apt(&["curl", "git", "vim"])).await;
        assert!(third.fast_skipped);
        assert!(machine.built().is_empty());
    }

    #[tokio::test]
    async fn layers_are_promoted_from_the_shared_store() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let shared = temp.path().join("shared");

        let first = Machine::new();
        first.build(&config, &shared, &apt(&["curl", "git"])).await;
        assert!(std::fs::read_dir(&shared).unwrap().count() >= 3);

        // Same cache index, empty local engine
        let second = Machine::new();
        let report = second.build(&config, &shared, &apt(&["curl", "git", "vim"])).await;
        assert_eq!(report.reused, 3);
        assert_eq!(report.promoted, 3);
        assert_eq!(second.built(), vec!["apt:vim"]);
        assert!(second.engine.has("app:latest"));
    }

    #[tokio::test]
    async fn config_layers_rebuild_on_every_build() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let shared = temp.path().join("shared");
        let machine = Machine::new();
        let yaml = concat!(
            "image_name: app\nlayers:\n  base: debian:12\n  apt: [curl]\n",
            "  config:\n    - name: motd\n      commands: [\"echo hi > /etc/motd\"]\n",
        );

        machine.build(&config, &shared, yaml).await;
        machine.built();
        ChecksumStore::new(&temp.path().join("cache"))
            .remove("app:latest")
            .await
            .unwrap();

        let report = machine.build(&config, &shared, yaml).await;
        assert_eq!(report.reused, 2);
        assert_eq!(report.config_rebuilt, 1);
        assert_eq!(machine.built(), vec!["config:motd"]);
    }
}
