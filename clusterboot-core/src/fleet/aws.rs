//! Fleet directory backed by AutoScaling and EC2 (query protocol)

use async_trait::async_trait;
use tracing::{debug, warn};
use url::form_urlencoded;

use super::xml::{self, Element};
use super::{FleetDirectory, GroupMember, LaunchGroup, Lifecycle, MemberHealth, MemberId, MemberPage, MemberStatus};
use crate::aws::{AwsResponse, ServiceClient};
use crate::error::{BootstrapError, Result};

const CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const AUTOSCALING_VERSION: &str = "2011-01-01";
const EC2_VERSION: &str = "2016-11-15";

/// Directory over the AutoScaling and EC2 APIs
pub struct AwsFleetDirectory {
    autoscaling: ServiceClient,
    ec2: ServiceClient,
}

impl AwsFleetDirectory {
    pub fn new(autoscaling: ServiceClient, ec2: ServiceClient) -> Self {
        Self { autoscaling, ec2 }
    }

    async fn query(
        client: &ServiceClient,
        action: &str,
        version: &str,
        params: &[(String, String)],
    ) -> Result<String> {
        // The serializer is not Send and must be gone before the await
        let body = {
            let mut form = form_urlencoded::Serializer::new(String::new());
            form.append_pair("Action", action).append_pair("Version", version);
            for (key, value) in params {
                form.append_pair(key, value);
            }
            form.finish()
        };

        let resp = client.post(CONTENT_TYPE, &[], body).await?;
        if !resp.status.is_success() {
            return Err(query_error(client, action, &resp));
        }
        Ok(resp.body)
    }
}

fn query_error(client: &ServiceClient, action: &str, resp: &AwsResponse) -> BootstrapError {
    let code = xml::find_text(&resp.body, "Code").unwrap_or_else(|| resp.status.as_str().to_string());
    let message = xml::find_text(&resp.body, "Message").unwrap_or_default();
    BootstrapError::ServiceError {
        service: client.service().signing_name().into(),
        code,
        message: format!("{}: {}", action, message),
        status: resp.status.as_u16(),
    }
}

fn malformed(service: &str, what: &str) -> BootstrapError {
    BootstrapError::ServiceError {
        service: service.into(),
        code: "MalformedResponse".into(),
        message: format!("response has no {}", what),
        status: 200,
    }
}

/// Parse one `DescribeAutoScalingGroups` page
fn parse_groups_page(body: &str) -> Result<(Vec<LaunchGroup>, Option<String>)> {
    let result = xml::root(body)
        .and_then(|root| root.child("DescribeAutoScalingGroupsResult"))
        .ok_or_else(|| malformed("autoscaling", "DescribeAutoScalingGroupsResult"))?;

    let groups = result
        .child("AutoScalingGroups")
        .map(|groups| groups.children_named("member"))
        .unwrap_or_default()
        .into_iter()
        .filter_map(|group| {
            let name = group.child_text("AutoScalingGroupName")?;
            let members = group
                .child("Instances")
                .map(|instances| instances.children_named("member"))
                .unwrap_or_default()
                .into_iter()
                .filter_map(|member| {
                    let id = member.child_text("InstanceId")?;
                    let health = member
                        .child_text("HealthStatus")
                        .map(|h| MemberHealth::parse(&h))
                        .unwrap_or(MemberHealth::Unhealthy);
                    Some(GroupMember {
                        id: MemberId::new(id),
                        health,
                    })
                })
                .collect();
            Some(LaunchGroup { name, members })
        })
        .collect();

    let next_token = result.child_text("NextToken").filter(|t| !t.is_empty());
    Ok((groups, next_token))
}

fn parse_instance(item: &Element<'_>) -> Option<MemberStatus> {
    let id = item.child_text("instanceId")?;
    let lifecycle = item
        .child("instanceState")
        .and_then(|state| state.child_text("name"))
        .map(|name| Lifecycle::parse(&name))
        .unwrap_or_else(|| Lifecycle::Other("unknown".into()));
    let address = item
        .child_text("privateIpAddress")
        .filter(|raw| !raw.is_empty())
        .and_then(|raw| match raw.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!("Instance {} has unparseable private address {:?}", id, raw);
                None
            }
        });
    Some(MemberStatus {
        id: MemberId::new(id),
        lifecycle,
        address,
    })
}

/// Parse one `DescribeInstances` page
fn parse_instances_page(body: &str) -> Result<MemberPage> {
    let root = xml::root(body).ok_or_else(|| malformed("ec2", "root element"))?;

    let members = root
        .child("reservationSet")
        .map(|set| set.children_named("item"))
        .unwrap_or_default()
        .into_iter()
        .flat_map(|reservation| {
            reservation
                .child("instancesSet")
                .map(|set| set.children_named("item"))
                .unwrap_or_default()
        })
        .filter_map(|item| parse_instance(&item))
        .collect();

    let next_token = root.child_text("nextToken").filter(|t| !t.is_empty());
    Ok(MemberPage { members, next_token })
}

#[async_trait]
impl FleetDirectory for AwsFleetDirectory {
    async fn list_groups(&self, names: &[String]) -> Result<Vec<LaunchGroup>> {
        let mut groups = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut params: Vec<(String, String)> = names
                .iter()
                .enumerate()
                .map(|(i, name)| (format!("AutoScalingGroupNames.member.{}", i + 1), name.clone()))
                .collect();
            if let Some(token) = &next_token {
                params.push(("NextToken".into(), token.clone()));
            }

            let body = Self::query(
                &self.autoscaling,
                "DescribeAutoScalingGroups",
                AUTOSCALING_VERSION,
                &params,
            )
            .await?;
            let (page, token) = parse_groups_page(&body)?;
            groups.extend(page);

            match token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }

        debug!("Listed {} of {} launch groups", groups.len(), names.len());
        Ok(groups)
    }

    async fn describe_members(&self, ids: &[MemberId], next_token: Option<&str>) -> Result<MemberPage> {
        let mut params: Vec<(String, String)> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (format!("InstanceId.{}", i + 1), id.to_string()))
            .collect();
        if let Some(token) = next_token {
            params.push(("NextToken".into(), token.to_string()));
        }

        let body = Self::query(&self.ec2, "DescribeInstances", EC2_VERSION, &params).await?;
        parse_instances_page(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::{AwsService, Credentials, HttpConfig, StaticCredentials};
    use std::sync::Arc;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GROUPS_XML: &str = r#"<DescribeAutoScalingGroupsResponse xmlns="http://autoscaling.amazonaws.com/doc/2011-01-01/">
  <DescribeAutoScalingGroupsResult>
    <AutoScalingGroups>
      <member>
        <AutoScalingGroupName>stack-MasterASG-1</AutoScalingGroupName>
        <Instances>
          <member>
            <InstanceId>i-master</InstanceId>
            <HealthStatus>Healthy</HealthStatus>
            <LifecycleState>InService</LifecycleState>
          </member>
        </Instances>
        <Tags>
          <member><Key>role</Key><Value>master</Value></member>
        </Tags>
      </member>
      <member>
        <AutoScalingGroupName>stack-WorkerASG-1</AutoScalingGroupName>
        <Instances>
          <member><InstanceId>i-w1</InstanceId><HealthStatus>Healthy</HealthStatus></member>
          <member><InstanceId>i-w2</InstanceId><HealthStatus>Unhealthy</HealthStatus></member>
        </Instances>
      </member>
    </AutoScalingGroups>
  </DescribeAutoScalingGroupsResult>
  <ResponseMetadata><RequestId>r</RequestId></ResponseMetadata>
</DescribeAutoScalingGroupsResponse>"#;

    const INSTANCES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DescribeInstancesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
  <requestId>r</requestId>
  <reservationSet>
    <item>
      <reservationId>r-1</reservationId>
      <instancesSet>
        <item>
          <instanceId>i-master</instanceId>
          <instanceState><code>16</code><name>running</name></instanceState>
          <privateIpAddress>10.0.0.1</privateIpAddress>
          <groupSet><item><groupId>sg-1</groupId></item></groupSet>
          <networkInterfaceSet>
            <item><privateIpAddress>10.9.9.9</privateIpAddress></item>
          </networkInterfaceSet>
        </item>
        <item>
          <instanceId>i-w1</instanceId>
          <instanceState><code>0</code><name>pending</name></instanceState>
        </item>
      </instancesSet>
    </item>
  </reservationSet>
  <nextToken>page-2</nextToken>
</DescribeInstancesResponse>"#;

    fn directory_for(server: &MockServer) -> AwsFleetDirectory {
        let credentials: Arc<StaticCredentials> =
            Arc::new(StaticCredentials::new(Credentials::new("AKID", "secret", None)));
        let http = HttpConfig::default();
        let autoscaling = ServiceClient::new(
            AwsService::AutoScaling,
            "us-east-1",
            Some(&server.uri()),
            &http,
            credentials.clone(),
        )
        .unwrap();
        let ec2 = ServiceClient::new(AwsService::Ec2, "us-east-1", Some(&server.uri()), &http, credentials)
            .unwrap();
        AwsFleetDirectory::new(autoscaling, ec2)
    }

    #[test]
    fn test_parse_groups() {
        let (groups, token) = parse_groups_page(GROUPS_XML).unwrap();
        assert_eq!(token, None);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "stack-MasterASG-1");
        assert_eq!(groups[0].members.len(), 1);
        assert_eq!(groups[1].members[1].id, MemberId::new("i-w2"));
        assert_eq!(groups[1].members[1].health, MemberHealth::Unhealthy);
    }

    #[test]
    fn test_parse_instances_uses_top_level_address() {
        let page = parse_instances_page(INSTANCES_XML).unwrap();
        assert_eq!(page.next_token.as_deref(), Some("page-2"));
        assert_eq!(page.members.len(), 2);

        assert_eq!(page.members[0].lifecycle, Lifecycle::Running);
        assert_eq!(page.members[0].address, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(page.members[1].lifecycle, Lifecycle::Pending);
        assert_eq!(page.members[1].address, None);
    }

    #[tokio::test]
    async fn test_list_groups_follows_next_token() {
        let server = MockServer::start().await;
        let first_page = GROUPS_XML.replace(
            "</AutoScalingGroups>",
            "</AutoScalingGroups><NextToken>tok-2</NextToken>",
        );
        Mock::given(method("POST"))
            .and(body_string_contains("NextToken=tok-2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(GROUPS_XML))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=DescribeAutoScalingGroups"))
            .respond_with(ResponseTemplate::new(200).set_body_string(first_page))
            .expect(1)
            .mount(&server)
            .await;

        let directory = directory_for(&server);
        let names = vec!["stack-MasterASG-1".to_string(), "stack-WorkerASG-1".to_string()];
        let groups = directory.list_groups(&names).await.unwrap();
        assert_eq!(groups.len(), 4);
    }

    #[tokio::test]
    async fn test_describe_members_sends_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=DescribeInstances"))
            .and(body_string_contains("InstanceId.1=i-master"))
            .and(body_string_contains("InstanceId.2=i-w1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INSTANCES_XML))
            .expect(1)
            .mount(&server)
            .await;

        let directory = directory_for(&server);
        let page = directory
            .describe_members(&[MemberId::new("i-master"), MemberId::new("i-w1")], None)
            .await
            .unwrap();
        assert_eq!(page.members.len(), 2);
    }

    #[tokio::test]
    async fn test_queries_run_on_spawned_tasks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=DescribeAutoScalingGroups"))
            .respond_with(ResponseTemplate::new(200).set_body_string(GROUPS_XML))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("Action=DescribeInstances"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INSTANCES_XML))
            .mount(&server)
            .await;

        let directory = Arc::new(directory_for(&server));
        let groups = tokio::spawn({
            let directory = directory.clone();
            async move {
                let names = vec!["stack-MasterASG-1".to_string()];
                directory.list_groups(&names).await
            }
        });
        let members = tokio::spawn({
            let directory = directory.clone();
            async move { directory.describe_members(&[MemberId::new("i-master")], None).await }
        });

        assert_eq!(groups.await.unwrap().unwrap().len(), 2);
        assert_eq!(members.await.unwrap().unwrap().members.len(), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                "<Response><Errors><Error><Code>InvalidInstanceID.NotFound</Code><Message>The instance ID 'i-x' does not exist</Message></Error></Errors><RequestID>r</RequestID></Response>",
            ))
            .mount(&server)
            .await;

        let directory = directory_for(&server);
        let err = directory
            .describe_members(&[MemberId::new("i-x")], None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("InvalidInstanceID.NotFound"));
    }
}
