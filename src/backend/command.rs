//! CloudFormation backend driven through the `aws` CLI.
//!
//! Each backend call runs one `aws cloudformation ...` process with JSON
//! output. Stack statuses are classified as:
//!
//! | status                                          | phase       |
//! |-------------------------------------------------|-------------|
//! | `*_IN_PROGRESS` (except `REVIEW_IN_PROGRESS`)   | in progress |
//! | `CREATE_COMPLETE`, `UPDATE_COMPLETE`, `IMPORT_COMPLETE` | success |
//! | `DELETE_COMPLETE`                               | absent      |
//! | anything else                                   | failure     |
//!
//! The deployed spec fingerprint travels as the [`FINGERPRINT_TAG`] stack tag.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{
    BackendError, DeployRequest, FINGERPRINT_TAG, OperationHandle, StackBackend, StackPhase,
    StackStatus,
};

const DEFAULT_CAPABILITIES: [&str; 3] = [
    "CAPABILITY_IAM",
    "CAPABILITY_NAMED_IAM",
    "CAPABILITY_AUTO_EXPAND",
];

/// [`StackBackend`] implementation that shells out to the AWS CLI.
#[derive(Debug, Clone)]
pub struct CloudFormationCli {
    program: PathBuf,
    region: Option<String>,
    profile: Option<String>,
    capabilities: Vec<String>,
}

impl Default for CloudFormationCli {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudFormationCli {
    pub fn new() -> Self {
        CloudFormationCli {
            program: PathBuf::from("aws"),
            region: None,
            profile: None,
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Uses a different executable in place of `aws`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("cloudformation").arg(subcommand);
        if let Some(region) = &self.region {
            cmd.arg("--region").arg(region);
        }
        if let Some(profile) = &self.profile {
            cmd.arg("--profile").arg(profile);
        }
        cmd.arg("--output")
            .arg("json")
            .env("AWS_PAGER", "")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<CliOutput, BackendError> {
        let output = cmd.output().await.map_err(|e| {
            BackendError::permanent(format!(
                "failed to run {}: {}",
                self.program.display(),
                e
            ))
            .with_source(e)
        })?;
        Ok(CliOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

struct CliOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl StackBackend for CloudFormationCli {
    #[instrument(skip(self, request), fields(stack = %request.stack_name))]
    async fn create_or_update(
        &self,
        request: &DeployRequest,
    ) -> Result<OperationHandle, BackendError> {
        let existing = self.describe_status(&request.stack_name).await?;
        let subcommand = match &existing {
            None => "create-stack",
            Some(status) if status.raw_status == "ROLLBACK_COMPLETE" => {
                return Err(BackendError::permanent(format!(
                    "stack {} is in ROLLBACK_COMPLETE and must be deleted before it can be created again",
                    request.stack_name
                )));
            }
            Some(_) => "update-stack",
        };

        let mut cmd = self.command(subcommand);
        cmd.args(deploy_args(request, &self.capabilities)?);
        debug!(subcommand, "submitting stack operation");
        let out = self.run(cmd).await?;

        if out.success {
            let parsed: StackIdOutput = serde_json::from_str(&out.stdout).map_err(|e| {
                BackendError::permanent(format!("unexpected {} output", subcommand)).with_source(e)
            })?;
            return Ok(OperationHandle {
                stack_id: Some(parsed.stack_id),
                no_op: false,
            });
        }
        if is_no_op(&out.stderr) {
            return Ok(OperationHandle {
                stack_id: existing.and_then(|s| s.stack_id),
                no_op: true,
            });
        }
        if is_already_underway(&out.stderr) {
            // An earlier attempt of this same call got through.
            return Ok(OperationHandle {
                stack_id: existing.and_then(|s| s.stack_id),
                no_op: false,
            });
        }
        Err(BackendError::from_message(out.stderr))
    }

    #[instrument(skip(self))]
    async fn describe_status(&self, stack_name: &str) -> Result<Option<StackStatus>, BackendError> {
        let mut cmd = self.command("describe-stacks");
        cmd.arg("--stack-name").arg(stack_name);
        let out = self.run(cmd).await?;

        if !out.success {
            if is_missing_stack(&out.stderr) {
                return Ok(None);
            }
            return Err(BackendError::from_message(out.stderr));
        }
        parse_describe(&out.stdout)
    }

    #[instrument(skip(self))]
    async fn rollback_or_delete(&self, stack_name: &str) -> Result<OperationHandle, BackendError> {
        let mut cmd = self.command("delete-stack");
        cmd.arg("--stack-name").arg(stack_name);
        let out = self.run(cmd).await?;

        if out.success || is_missing_stack(&out.stderr) {
            return Ok(OperationHandle::default());
        }
        Err(BackendError::from_message(out.stderr))
    }
}

// ─── CLI JSON shapes ───

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackIdOutput {
    stack_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacksOutput {
    #[serde(default)]
    stacks: Vec<CfnStack>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CfnStack {
    stack_id: Option<String>,
    stack_status: String,
    stack_status_reason: Option<String>,
    #[serde(default)]
    outputs: Vec<CfnOutput>,
    #[serde(default)]
    tags: Vec<CfnTag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CfnOutput {
    output_key: String,
    output_value: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CfnTag {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CfnParameter<'a> {
    parameter_key: &'a str,
    parameter_value: &'a str,
}

/// Classifies a CloudFormation stack status. `None` means the stack is gone.
pub fn classify_status(raw: &str) -> Option<StackPhase> {
    match raw {
        "DELETE_COMPLETE" => None,
        "CREATE_COMPLETE" | "UPDATE_COMPLETE" | "IMPORT_COMPLETE" => Some(StackPhase::Success),
        // Created by a change set that was never executed; it will not progress.
        "REVIEW_IN_PROGRESS" => Some(StackPhase::Failure),
        s if s.ends_with("_IN_PROGRESS") => Some(StackPhase::InProgress),
        _ => Some(StackPhase::Failure),
    }
}

fn parse_describe(stdout: &str) -> Result<Option<StackStatus>, BackendError> {
    let parsed: DescribeStacksOutput = serde_json::from_str(stdout).map_err(|e| {
        BackendError::permanent("unexpected describe-stacks output").with_source(e)
    })?;
    let Some(stack) = parsed.stacks.into_iter().next() else {
        return Ok(None);
    };
    let Some(phase) = classify_status(&stack.stack_status) else {
        return Ok(None);
    };

    let fingerprint = stack
        .tags
        .iter()
        .find(|t| t.key == FINGERPRINT_TAG)
        .map(|t| t.value.clone());
    let outputs: BTreeMap<String, String> = stack
        .outputs
        .into_iter()
        .map(|o| (o.output_key, o.output_value))
        .collect();

    Ok(Some(StackStatus {
        phase,
        raw_status: stack.stack_status,
        stack_id: stack.stack_id,
        reason: stack.stack_status_reason,
        outputs,
        fingerprint,
    }))
}

/// Arguments shared by `create-stack` and `update-stack`.
fn deploy_args(
    request: &DeployRequest,
    capabilities: &[String],
) -> Result<Vec<String>, BackendError> {
    let mut args = vec!["--stack-name".to_string(), request.stack_name.clone()];

    if request.template.is_url() {
        args.push("--template-url".to_string());
        args.push(request.template.as_str().to_string());
    } else {
        args.push("--template-body".to_string());
        args.push(format!("file://{}", request.template.as_str()));
    }

    if !request.parameters.is_empty() {
        let parameters: Vec<CfnParameter<'_>> = request
            .parameters
            .iter()
            .map(|(k, v)| CfnParameter {
                parameter_key: k,
                parameter_value: v,
            })
            .collect();
        args.push("--parameters".to_string());
        args.push(json_arg("--parameters", &parameters)?);
    }

    if !capabilities.is_empty() {
        args.push("--capabilities".to_string());
        args.extend(capabilities.iter().cloned());
    }

    let mut tags: Vec<CfnTag> = request
        .tags
        .iter()
        .filter(|(k, _)| k.as_str() != FINGERPRINT_TAG)
        .map(|(k, v)| CfnTag {
            key: k.clone(),
            value: v.clone(),
        })
        .collect();
    tags.push(CfnTag {
        key: FINGERPRINT_TAG.to_string(),
        value: request.fingerprint.clone(),
    });
    args.push("--tags".to_string());
    args.push(json_arg("--tags", &tags)?);

    Ok(args)
}

/// Encodes a JSON-valued CLI argument.
fn json_arg<T: Serialize + ?Sized>(flag: &str, value: &T) -> Result<String, BackendError> {
    serde_json::to_string(value).map_err(|e| {
        BackendError::permanent(format!("cannot encode {} argument", flag)).with_source(e)
    })
}

fn is_missing_stack(stderr: &str) -> bool {
    stderr.contains("does not exist")
}

fn is_no_op(stderr: &str) -> bool {
    stderr.contains("No updates are to be performed")
}

fn is_already_underway(stderr: &str) -> bool {
    stderr.contains("AlreadyExistsException")
        || (stderr.contains("_IN_PROGRESS state") && stderr.contains("can not be updated"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TemplateRef;

    fn request(template: &str) -> DeployRequest {
        DeployRequest {
            stack_name: "shop-app".to_string(),
            template: TemplateRef::new(template),
            parameters: BTreeMap::from([("Env".to_string(), "prod,eu".to_string())]),
            tags: BTreeMap::from([("team".to_string(), "payments".to_string())]),
            fingerprint: "abc123".to_string(),
        }
    }

    // ─── Status classification ───

    #[test]
    fn classifies_statuses() {
        assert_eq!(classify_status("CREATE_IN_PROGRESS"), Some(StackPhase::InProgress));
        assert_eq!(
            classify_status("UPDATE_COMPLETE_CLEANUP_IN_PROGRESS"),
            Some(StackPhase::InProgress)
        );
        assert_eq!(
            classify_status("UPDATE_ROLLBACK_IN_PROGRESS"),
            Some(StackPhase::InProgress)
        );
        assert_eq!(classify_status("CREATE_COMPLETE"), Some(StackPhase::Success));
        assert_eq!(classify_status("UPDATE_COMPLETE"), Some(StackPhase::Success));
        assert_eq!(classify_status("ROLLBACK_COMPLETE"), Some(StackPhase::Failure));
        assert_eq!(
            classify_status("UPDATE_ROLLBACK_COMPLETE"),
            Some(StackPhase::Failure)
        );
        assert_eq!(classify_status("CREATE_FAILED"), Some(StackPhase::Failure));
        assert_eq!(classify_status("REVIEW_IN_PROGRESS"), Some(StackPhase::Failure));
        assert_eq!(classify_status("DELETE_COMPLETE"), None);
    }

    // ─── describe-stacks parsing ───

    #[test]
    fn parses_describe_output() {
        let stdout = r#"{
            "Stacks": [{
                "StackId": "arn:aws:cloudformation:eu-west-1:123:stack/shop-app/1",
                "StackName": "shop-app",
                "StackStatus": "UPDATE_COMPLETE",
                "Outputs": [{"OutputKey": "Url", "OutputValue": "https://shop"}],
                "Tags": [
                    {"Key": "team", "Value": "payments"},
                    {"Key": "stackline:fingerprint", "Value": "abc123"}
                ]
            }]
        }"#;

        let status = parse_describe(stdout).unwrap().unwrap();
        assert_eq!(status.phase, StackPhase::Success);
        assert_eq!(status.raw_status, "UPDATE_COMPLETE");
        assert_eq!(status.fingerprint.as_deref(), Some("abc123"));
        assert_eq!(status.outputs["Url"], "https://shop");
        assert!(status.stack_id.unwrap().contains("shop-app"));
    }

    #[test]
    fn parses_failure_reason() {
        let stdout = r#"{"Stacks": [{
            "StackName": "shop-app",
            "StackStatus": "UPDATE_ROLLBACK_COMPLETE",
            "StackStatusReason": "Resource Bucket failed to create"
        }]}"#;

        let status = parse_describe(stdout).unwrap().unwrap();
        assert_eq!(status.phase, StackPhase::Failure);
        assert_eq!(
            status.reason.as_deref(),
            Some("Resource Bucket failed to create")
        );
        assert!(status.fingerprint.is_none());
    }

    #[test]
    fn deleted_stack_is_absent() {
        let stdout = r#"{"Stacks": [{"StackName": "x", "StackStatus": "DELETE_COMPLETE"}]}"#;
        assert_eq!(parse_describe(stdout).unwrap(), None);
        assert_eq!(parse_describe(r#"{"Stacks": []}"#).unwrap(), None);
    }

    #[test]
    fn garbage_output_is_permanent_error() {
        let err = parse_describe("not json").unwrap_err();
        assert!(!err.is_transient());
    }

    // ─── Argument building ───

    #[test]
    fn file_template_uses_template_body() {
        let args = deploy_args(&request("out/app.yaml"), &[]).unwrap();
        let pos = args.iter().position(|a| a == "--template-body").unwrap();
        assert_eq!(args[pos + 1], "file://out/app.yaml");
        assert!(!args.contains(&"--capabilities".to_string()));
    }

    #[test]
    fn url_template_uses_template_url() {
        let args = deploy_args(&request("https://bucket.s3.amazonaws.com/app.yaml"), &[]).unwrap();
        let pos = args.iter().position(|a| a == "--template-url").unwrap();
        assert_eq!(args[pos + 1], "https://bucket.s3.amazonaws.com/app.yaml");
    }

    #[test]
    fn parameters_are_passed_as_json() {
        let args = deploy_args(&request("app.yaml"), &[]).unwrap();
        let pos = args.iter().position(|a| a == "--parameters").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&args[pos + 1]).unwrap();
        assert_eq!(
            parsed,
            serde_json::json!([{"ParameterKey": "Env", "ParameterValue": "prod,eu"}])
        );
    }

    #[test]
    fn unencodable_argument_is_permanent_error() {
        struct Unencodable;

        impl Serialize for Unencodable {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("not representable"))
            }
        }

        let err = json_arg("--tags", &Unencodable).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message.contains("--tags"));
    }

    #[test]
    fn fingerprint_is_added_as_tag() {
        let args = deploy_args(&request("app.yaml"), &["CAPABILITY_IAM".to_string()]).unwrap();
        let pos = args.iter().position(|a| a == "--tags").unwrap();
        let tags: Vec<CfnTag> = serde_json::from_str(&args[pos + 1]).unwrap();
        assert_eq!(tags.len(), 2);
        assert!(
            tags.iter()
                .any(|t| t.key == FINGERPRINT_TAG && t.value == "abc123")
        );
        assert!(args.contains(&"CAPABILITY_IAM".to_string()));
    }

    // ─── Error text recognition ───

    #[test]
    fn recognizes_cli_error_texts() {
        assert!(is_missing_stack(
            "An error occurred (ValidationError) when calling the DescribeStacks operation: Stack with id app does not exist"
        ));
        assert!(is_no_op(
            "An error occurred (ValidationError) when calling the UpdateStack operation: No updates are to be performed."
        ));
        assert!(is_already_underway(
            "An error occurred (ValidationError) when calling the UpdateStack operation: Stack:arn is in UPDATE_IN_PROGRESS state and can not be updated."
        ));
        assert!(is_already_underway(
            "An error occurred (AlreadyExistsException) when calling the CreateStack operation: Stack [app] already exists"
        ));
    }

    // ─── Process plumbing ───

    #[cfg(unix)]
    mod fake_cli {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// Writes a shell script standing in for `aws`.
        fn fake_aws(script: &str) -> (TempDir, PathBuf) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("aws");
            std::fs::write(&path, format!("#!/bin/sh\n{}", script)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            (dir, path)
        }

        #[tokio::test]
        async fn describe_missing_stack_is_none() {
            let (_dir, aws) = fake_aws(
                "echo 'An error occurred (ValidationError): Stack with id x does not exist' >&2\nexit 254\n",
            );
            let backend = CloudFormationCli::new().with_program(aws);
            assert_eq!(backend.describe_status("x").await.unwrap(), None);
        }

        #[tokio::test]
        async fn describe_parses_stdout() {
            let (_dir, aws) = fake_aws(
                "echo '{\"Stacks\":[{\"StackId\":\"id-1\",\"StackStatus\":\"CREATE_IN_PROGRESS\"}]}'\n",
            );
            let backend = CloudFormationCli::new().with_program(aws);
            let status = backend.describe_status("x").await.unwrap().unwrap();
            assert_eq!(status.phase, StackPhase::InProgress);
            assert_eq!(status.stack_id.as_deref(), Some("id-1"));
        }

        #[tokio::test]
        async fn throttling_is_transient() {
            let (_dir, aws) = fake_aws(
                "echo 'An error occurred (Throttling) when calling the DescribeStacks operation: Rate exceeded' >&2\nexit 254\n",
            );
            let backend = CloudFormationCli::new().with_program(aws);
            let err = backend.describe_status("x").await.unwrap_err();
            assert!(err.is_transient());
        }

        #[tokio::test]
        async fn deleting_missing_stack_succeeds() {
            let (_dir, aws) = fake_aws(
                "echo 'An error occurred (ValidationError): Stack with id x does not exist' >&2\nexit 254\n",
            );
            let backend = CloudFormationCli::new().with_program(aws);
            assert!(backend.rollback_or_delete("x").await.is_ok());
        }

        #[tokio::test]
        async fn missing_program_is_permanent() {
            let backend = CloudFormationCli::new().with_program("/nonexistent/aws");
            let err = backend.describe_status("x").await.unwrap_err();
            assert!(!err.is_transient());
        }
    }
}
