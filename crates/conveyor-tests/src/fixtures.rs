//! Sample pipelines and commit contexts.

use conveyor_core::context::CommitContext;
use conveyor_core::pipeline::PipelineDefinition;

pub const SHA: &str = "3f2a9c1d7b6e5f4a3b2c1d0e9f8a7b6c5d4e3f2a";
pub const PROJECT: &str = "acme/webapp";

/// The web application pipeline: build, test, then a deploy target chosen
/// by the workflow rules, then verification.
pub const WEBAPP: &str = r#"
name: webapp
variables:
  IMAGE_NAME: registry.example.com/webapp
workflow:
  rules:
    - if: { branch: development }
      variables: { TARGET_ENV: dev }
    - if: { branch: main }
      variables: { TARGET_ENV: staging }
    - if: { tag_matches: '^\d+\.\d+\.\d+$' }
      variables: { TARGET_ENV: production }
    - when: never
stages: [build, test, deploy, verify]
environments:
  - { name: production, protected: true }
templates:
  .deploy:
    stage: deploy
    retry: { max: 2 }
    notify: true
jobs:
  - name: build
    stage: build
    script: ["make build"]
    artifacts: { paths: [dist/] }
  - name: unit_tests
    stage: test
    needs: [build]
    script: ["make test"]
  - name: deploy_dev
    extends: [.deploy]
    script: ["./deploy.sh $CI_ENVIRONMENT_NAME"]
    environment: { name: "dev/$CI_COMMIT_REF_SLUG", url: "https://$CI_COMMIT_REF_SLUG.dev.example.com" }
    rules:
      - if: { variable: { name: TARGET_ENV, equals: dev } }
      - when: never
  - name: deploy_staging
    extends: [.deploy]
    script: ["./deploy.sh staging"]
    environment: { name: staging, url: https://staging.example.com }
    rules:
      - if: { variable: { name: TARGET_ENV, equals: staging } }
      - when: never
  - name: deploy_production
    extends: [.deploy]
    when: manual
    script: ["./deploy.sh production"]
    environment: { name: production, url: https://example.com }
    rules:
      - if: { variable: { name: TARGET_ENV, equals: production } }
      - when: never
  - name: smoke_tests
    stage: verify
    script: ["./smoke.sh"]
    rules:
      - if: { any: [{ variable: { name: TARGET_ENV, equals: dev } }, { variable: { name: TARGET_ENV, equals: staging } }] }
      - when: never
  - name: health_checks
    stage: verify
    needs: [deploy_production]
    script: ["./health.sh"]
    rules:
      - if: { variable: { name: TARGET_ENV, equals: production } }
      - when: never
"#;

pub fn webapp() -> PipelineDefinition {
    parse(WEBAPP)
}

pub fn parse(yaml: &str) -> PipelineDefinition {
    PipelineDefinition::from_yaml(yaml).expect("fixture pipeline parses")
}

pub fn branch(name: &str) -> CommitContext {
    CommitContext::branch(name, SHA, PROJECT).with_actor("dana")
}

pub fn tag(name: &str) -> CommitContext {
    CommitContext::tag(name, SHA, PROJECT).with_actor("dana")
}
