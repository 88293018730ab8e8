use std::{
    collections::BTreeMap,
    io::{BufRead, Write},
};

use tracing::debug;

use crate::error::{Error, Result};

/// An authorization to assume `role_arn` through `identity_provider`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleArn {
    pub identity_provider: String,
    pub role_arn: String,
}

/// Roles in the order the identity provider returned them.
pub type RoleCatalog = Vec<RoleArn>;

/// Accounts in ascending order, each with `(original_index, role_name)`
/// entries in ascending role-name order.
pub type SortedRoles = Vec<(String, Vec<(usize, String)>)>;

impl RoleArn {
    /// Build a role, rejecting ARNs that do not yield an account id and role name.
    pub fn new(identity_provider: impl Into<String>, role_arn: impl Into<String>) -> Result<Self> {
        let role = Self {
            identity_provider: identity_provider.into(),
            role_arn: role_arn.into(),
        };
        role.account_id()?;
        role.role_name()?;
        Ok(role)
    }

    /// Parse a SAML role attribute value ("provider_arn,role_arn" in either order).
    pub fn parse_attribute(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.split(',').map(str::trim).collect();
        let [first, second] = parts.as_slice() else {
            return Err(Error::InvalidRoleArn(value.to_string()));
        };

        let (role_arn, provider_arn) = if first.contains(":role/") {
            (*first, *second)
        } else {
            (*second, *first)
        };

        if !role_arn.contains(":role/") || !provider_arn.contains(":saml-provider/") {
            return Err(Error::InvalidRoleArn(value.to_string()));
        }

        Self::new(provider_arn, role_arn)
    }

    /// 5th colon-delimited field of the role ARN.
    pub fn account_id(&self) -> Result<&str> {
        self.role_arn
            .split(':')
            .nth(4)
            .filter(|account| !account.is_empty())
            .ok_or_else(|| Error::InvalidRoleArn(self.role_arn.clone()))
    }

    /// Second `/` segment of the 6th colon-delimited field ("role/Name" -> "Name").
    ///
    /// A role with a path is listed under its first path element.
    pub fn role_name(&self) -> Result<&str> {
        let resource = self
            .role_arn
            .split(':')
            .nth(5)
            .ok_or_else(|| Error::InvalidRoleArn(self.role_arn.clone()))?;

        resource
            .split('/')
            .nth(1)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::InvalidRoleArn(self.role_arn.clone()))
    }
}

/// Group roles by account and sort accounts, then role names, lexically.
///
/// Duplicate `(account, role)` pairs are all retained in original order.
pub fn sort_roles(roles: &[RoleArn]) -> Result<SortedRoles> {
    let mut accounts: BTreeMap<String, Vec<(usize, String)>> = BTreeMap::new();

    for (index, role) in roles.iter().enumerate() {
        accounts
            .entry(role.account_id()?.to_string())
            .or_default()
            .push((index, role.role_name()?.to_string()));
    }

    Ok(accounts
        .into_iter()
        .map(|(account, mut entries)| {
            entries.sort_by(|a, b| a.1.cmp(&b.1));
            (account, entries)
        })
        .collect())
}

/// The sorted presentation shown when more than one role is available.
///
/// Display index `i` maps to `order[i]`, the role's original catalog index.
#[derive(Debug, Clone)]
pub struct SelectionMenu {
    accounts: SortedRoles,
    order: Vec<usize>,
}

impl SelectionMenu {
    pub fn new(roles: &[RoleArn]) -> Result<Self> {
        let accounts = sort_roles(roles)?;
        let order = accounts
            .iter()
            .flat_map(|(_, entries)| entries.iter().map(|(index, _)| *index))
            .collect();
        Ok(Self { accounts, order })
    }

    pub fn render(&self) -> String {
        let mut out = String::from("Please choose the role you would like to assume:\n");
        let mut i = 0;
        for (account, entries) in &self.accounts {
            out.push_str(&format!("     Account: {account}\n"));
            for (_, name) in entries {
                out.push_str(&format!("         [ {i} ]: {name}\n"));
                i += 1;
            }
        }
        out
    }

    /// Map a typed display index back to the original catalog index.
    pub fn resolve(&self, answer: &str) -> Result<usize> {
        let answer = answer.trim();
        let display: usize = answer
            .parse()
            .map_err(|_| Error::InvalidSelection(format!("'{answer}' is not a number")))?;

        self.order.get(display).copied().ok_or_else(|| {
            Error::InvalidSelection(format!(
                "{display} is out of range (0-{})",
                self.order.len().saturating_sub(1)
            ))
        })
    }
}

/// Roles offered by the IdP (empty state excluded at the type level)
#[derive(Debug, Clone)]
pub enum AvailableRoles {
    /// Single role, selected without interaction
    Single(RoleArn),
    /// Multiple roles, selected by configuration or prompt
    Multiple(Vec<RoleArn>),
}

impl AvailableRoles {
    pub fn from_catalog(mut roles: RoleCatalog) -> Result<Self> {
        match roles.len() {
            0 => Err(Error::NoRolesAvailable),
            1 => Ok(AvailableRoles::Single(roles.remove(0))),
            _ => Ok(AvailableRoles::Multiple(roles)),
        }
    }

    /// Pick the configured role without prompting, if one is configured.
    pub fn preselect(&self, role_arn: &str) -> Result<RoleArn> {
        self.as_slice()
            .iter()
            .find(|role| role.role_arn == role_arn)
            .cloned()
            .ok_or_else(|| Error::RoleNotFound(role_arn.to_string()))
    }

    /// Resolve to exactly one role.
    ///
    /// A single role is returned without touching `input` or `output`.
    pub fn select<R: BufRead, W: Write>(
        self,
        preferred: Option<&str>,
        input: &mut R,
        output: &mut W,
    ) -> Result<RoleArn> {
        if let Some(role_arn) = preferred {
            return self.preselect(role_arn);
        }

        match self {
            AvailableRoles::Single(role) => Ok(role),
            AvailableRoles::Multiple(roles) => {
                let menu = SelectionMenu::new(&roles)?;
                write!(output, "{}Selection:\x07 ", menu.render())?;
                output.flush()?;

                let mut answer = String::new();
                input.read_line(&mut answer)?;
                let index = menu.resolve(&answer)?;
                debug!(index, role_arn = %roles[index].role_arn, "Role selected");
                Ok(roles[index].clone())
            }
        }
    }

    pub fn as_slice(&self) -> &[RoleArn] {
        match self {
            AvailableRoles::Single(role) => std::slice::from_ref(role),
            AvailableRoles::Multiple(roles) => roles.as_slice(),
        }
    }
}

/// Select a role from a catalog, prompting only when several are available.
pub fn select_role<R: BufRead, W: Write>(
    roles: RoleCatalog,
    preferred: Option<&str>,
    input: &mut R,
    output: &mut W,
) -> Result<RoleArn> {
    AvailableRoles::from_catalog(roles)?.select(preferred, input, output)
}
