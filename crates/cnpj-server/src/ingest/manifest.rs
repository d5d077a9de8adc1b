//! Dataset manifest
//!
//! The closed set of CNPJ dataset types, each with its destination table,
//! archive naming convention and positional column layout. Source files have
//! no header row, so column `i` of a row always maps to `columns()[i]`.
//!
//! New releases add archive instances, never new types. A layout change by
//! the publisher bumps [`MANIFEST_VERSION`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use cnpj_common::EtlError;

pub const MANIFEST_VERSION: u32 = 1;

/// Establishment column holding the full 14-digit CNPJ
pub const COMPOSITE_COLUMN: &str = "cnpj_completo";

const LOOKUP_COLUMNS: &[&str] = &["codigo", "descricao"];

const EMPRESA_COLUMNS: &[&str] = &[
    "cnpj_basico",
    "razao_social",
    "natureza_juridica",
    "qualificacao_responsavel",
    "capital_social",
    "porte_empresa",
    "ente_federativo_responsavel",
];

const ESTABELECIMENTO_COLUMNS: &[&str] = &[
    "cnpj_basico",
    "cnpj_ordem",
    "cnpj_dv",
    "identificador_matriz_filial",
    "nome_fantasia",
    "situacao_cadastral",
    "data_situacao_cadastral",
    "motivo_situacao_cadastral",
    "cidade_exterior",
    "pais",
    "data_inicio_atividade",
    "cnae_fiscal_principal",
    "cnae_fiscal_secundaria",
    "tipo_logradouro",
    "logradouro",
    "numero",
    "complemento",
    "bairro",
    "cep",
    "uf",
    "municipio",
    "ddd_1",
    "telefone_1",
    "ddd_2",
    "telefone_2",
    "ddd_fax",
    "fax",
    "email",
    "situacao_especial",
    "data_situacao_especial",
];

const ESTABELECIMENTO_LOAD_COLUMNS: &[&str] = &[
    "cnpj_basico",
    "cnpj_ordem",
    "cnpj_dv",
    "identificador_matriz_filial",
    "nome_fantasia",
    "situacao_cadastral",
    "data_situacao_cadastral",
    "motivo_situacao_cadastral",
    "cidade_exterior",
    "pais",
    "data_inicio_atividade",
    "cnae_fiscal_principal",
    "cnae_fiscal_secundaria",
    "tipo_logradouro",
    "logradouro",
    "numero",
    "complemento",
    "bairro",
    "cep",
    "uf",
    "municipio",
    "ddd_1",
    "telefone_1",
    "ddd_2",
    "telefone_2",
    "ddd_fax",
    "fax",
    "email",
    "situacao_especial",
    "data_situacao_especial",
    COMPOSITE_COLUMN,
];

const SOCIO_COLUMNS: &[&str] = &[
    "cnpj_basico",
    "identificador_socio",
    "nome_socio",
    "cpf_cnpj_socio",
    "qualificacao_socio",
    "data_entrada_sociedade",
    "pais",
    "representante_legal",
    "nome_representante",
    "qualificacao_representante",
    "faixa_etaria",
];

const SIMPLES_COLUMNS: &[&str] = &[
    "cnpj_basico",
    "opcao_simples",
    "data_opcao_simples",
    "data_exclusao_simples",
    "opcao_mei",
    "data_opcao_mei",
    "data_exclusao_mei",
];

/// One CNPJ dataset type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetType {
    Cnae,
    Motivo,
    Municipio,
    Natureza,
    Pais,
    Qualificacao,
    Empresa,
    Estabelecimento,
    Socio,
    Simples,
}

impl DatasetType {
    /// Load order: lookups, then companies, then the tables keyed by company.
    pub const DEPENDENCY_ORDER: [DatasetType; 10] = [
        DatasetType::Cnae,
        DatasetType::Motivo,
        DatasetType::Municipio,
        DatasetType::Natureza,
        DatasetType::Pais,
        DatasetType::Qualificacao,
        DatasetType::Empresa,
        DatasetType::Estabelecimento,
        DatasetType::Socio,
        DatasetType::Simples,
    ];

    /// Marker matching order. Entity markers come first so a lookup marker
    /// can never shadow them.
    const CLASSIFICATION_ORDER: [DatasetType; 10] = [
        DatasetType::Empresa,
        DatasetType::Estabelecimento,
        DatasetType::Socio,
        DatasetType::Simples,
        DatasetType::Cnae,
        DatasetType::Motivo,
        DatasetType::Municipio,
        DatasetType::Natureza,
        DatasetType::Pais,
        DatasetType::Qualificacao,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetType::Cnae => "cnae",
            DatasetType::Motivo => "motivo",
            DatasetType::Municipio => "municipio",
            DatasetType::Natureza => "natureza",
            DatasetType::Pais => "pais",
            DatasetType::Qualificacao => "qualificacao",
            DatasetType::Empresa => "empresa",
            DatasetType::Estabelecimento => "estabelecimento",
            DatasetType::Socio => "socio",
            DatasetType::Simples => "simples",
        }
    }

    /// Destination table
    pub fn table(&self) -> &'static str {
        match self {
            DatasetType::Cnae => "cnaes",
            DatasetType::Motivo => "motivos",
            DatasetType::Municipio => "municipios",
            DatasetType::Natureza => "naturezas",
            DatasetType::Pais => "paises",
            DatasetType::Qualificacao => "qualificacoes",
            DatasetType::Empresa => "empresas",
            DatasetType::Estabelecimento => "estabelecimentos",
            DatasetType::Socio => "socios",
            DatasetType::Simples => "simples",
        }
    }

    /// Remote archive name prefix (`Empresas0.zip`, `Cnaes.zip`)
    pub fn archive_prefix(&self) -> &'static str {
        match self {
            DatasetType::Cnae => "Cnaes",
            DatasetType::Motivo => "Motivos",
            DatasetType::Municipio => "Municipios",
            DatasetType::Natureza => "Naturezas",
            DatasetType::Pais => "Paises",
            DatasetType::Qualificacao => "Qualificacoes",
            DatasetType::Empresa => "Empresas",
            DatasetType::Estabelecimento => "Estabelecimentos",
            DatasetType::Socio => "Socios",
            DatasetType::Simples => "Simples",
        }
    }

    /// Uppercase substrings identifying both archive and inner file names
    /// (`Naturezas.zip` holds `F.K03200$W.SCTE.NATJUCSV`).
    pub fn markers(&self) -> &'static [&'static str] {
        match self {
            DatasetType::Cnae => &["CNAE"],
            DatasetType::Motivo => &["MOTI"],
            DatasetType::Municipio => &["MUNIC"],
            DatasetType::Natureza => &["NATJU", "NATUR"],
            DatasetType::Pais => &["PAIS"],
            DatasetType::Qualificacao => &["QUALS", "QUALI"],
            DatasetType::Empresa => &["EMPRE"],
            DatasetType::Estabelecimento => &["ESTABELE"],
            DatasetType::Socio => &["SOCIO"],
            DatasetType::Simples => &["SIMPLES"],
        }
    }

    /// Source columns in file order
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            DatasetType::Empresa => EMPRESA_COLUMNS,
            DatasetType::Estabelecimento => ESTABELECIMENTO_COLUMNS,
            DatasetType::Socio => SOCIO_COLUMNS,
            DatasetType::Simples => SIMPLES_COLUMNS,
            _ => LOOKUP_COLUMNS,
        }
    }

    /// Columns written by COPY: the source columns plus any derived column
    pub fn load_columns(&self) -> &'static [&'static str] {
        match self {
            DatasetType::Estabelecimento => ESTABELECIMENTO_LOAD_COLUMNS,
            other => other.columns(),
        }
    }

    pub fn has_derived_field(&self) -> bool {
        matches!(self, DatasetType::Estabelecimento)
    }

    pub fn is_lookup(&self) -> bool {
        self.group() == LoadGroup::Auxiliares
    }

    pub fn group(&self) -> LoadGroup {
        match self {
            DatasetType::Empresa => LoadGroup::Empresas,
            DatasetType::Estabelecimento => LoadGroup::Estabelecimentos,
            DatasetType::Socio => LoadGroup::Socios,
            DatasetType::Simples => LoadGroup::Simples,
            _ => LoadGroup::Auxiliares,
        }
    }

    /// Dependency tier; a type only loads after every lower tier has committed.
    pub fn tier(&self) -> u8 {
        match self {
            DatasetType::Empresa => 1,
            DatasetType::Estabelecimento | DatasetType::Socio => 2,
            DatasetType::Simples => 3,
            _ => 0,
        }
    }

    /// Classify an archive or inner file name; first marker match wins.
    ///
    /// Returns `None` for files outside the manifest (layouts, PDFs); callers
    /// skip those.
    pub fn classify(file_name: &str) -> Option<DatasetType> {
        let upper = file_name.to_uppercase();
        Self::CLASSIFICATION_ORDER
            .into_iter()
            .find(|dataset| dataset.markers().iter().any(|marker| upper.contains(marker)))
    }

    /// Position of a named column in the source layout
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns().iter().position(|c| *c == column)
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetType {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Self::DEPENDENCY_ORDER
            .into_iter()
            .find(|dataset| dataset.as_str() == lower || dataset.table() == lower)
            .ok_or_else(|| EtlError::UnknownDataset(s.to_string()))
    }
}

/// Dataset subsets a job can be restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadGroup {
    /// The six lookup tables
    Auxiliares,
    Empresas,
    Estabelecimentos,
    Socios,
    Simples,
    All,
}

impl LoadGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadGroup::Auxiliares => "auxiliares",
            LoadGroup::Empresas => "empresas",
            LoadGroup::Estabelecimentos => "estabelecimentos",
            LoadGroup::Socios => "socios",
            LoadGroup::Simples => "simples",
            LoadGroup::All => "all",
        }
    }

    pub fn contains(&self, dataset: DatasetType) -> bool {
        *self == LoadGroup::All || dataset.group() == *self
    }

    /// Dataset types selected by `groups`, in dependency order.
    ///
    /// An empty selection means everything.
    pub fn plan(groups: &[LoadGroup]) -> Vec<DatasetType> {
        DatasetType::DEPENDENCY_ORDER
            .into_iter()
            .filter(|dataset| groups.is_empty() || groups.iter().any(|g| g.contains(*dataset)))
            .collect()
    }
}

impl fmt::Display for LoadGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadGroup {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auxiliares" | "lookups" => Ok(LoadGroup::Auxiliares),
            "empresas" => Ok(LoadGroup::Empresas),
            "estabelecimentos" => Ok(LoadGroup::Estabelecimentos),
            "socios" => Ok(LoadGroup::Socios),
            "simples" => Ok(LoadGroup::Simples),
            "all" => Ok(LoadGroup::All),
            _ => Err(EtlError::UnknownDataset(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_archive_names() {
        assert_eq!(DatasetType::classify("Empresas3.zip"), Some(DatasetType::Empresa));
        assert_eq!(
            DatasetType::classify("Estabelecimentos0.zip"),
            Some(DatasetType::Estabelecimento)
        );
        assert_eq!(DatasetType::classify("Socios9.zip"), Some(DatasetType::Socio));
        assert_eq!(DatasetType::classify("Simples.zip"), Some(DatasetType::Simples));
        assert_eq!(DatasetType::classify("Cnaes.zip"), Some(DatasetType::Cnae));
        assert_eq!(DatasetType::classify("Motivos.zip"), Some(DatasetType::Motivo));
        assert_eq!(DatasetType::classify("Municipios.zip"), Some(DatasetType::Municipio));
        assert_eq!(DatasetType::classify("Naturezas.zip"), Some(DatasetType::Natureza));
        assert_eq!(DatasetType::classify("Paises.zip"), Some(DatasetType::Pais));
        assert_eq!(
            DatasetType::classify("Qualificacoes.zip"),
            Some(DatasetType::Qualificacao)
        );
    }

    #[test]
    fn test_classify_inner_file_names() {
        assert_eq!(
            DatasetType::classify("K3241.K03200Y0.D40511.EMPRECSV"),
            Some(DatasetType::Empresa)
        );
        assert_eq!(
            DatasetType::classify("K3241.K03200Y1.D40511.ESTABELE"),
            Some(DatasetType::Estabelecimento)
        );
        assert_eq!(
            DatasetType::classify("K3241.K03200Y2.D40511.SOCIOCSV"),
            Some(DatasetType::Socio)
        );
        assert_eq!(
            DatasetType::classify("F.K03200$W.SIMPLES.CSV.D40511"),
            Some(DatasetType::Simples)
        );
        assert_eq!(
            DatasetType::classify("F.K03200$Z.D40511.NATJUCSV"),
            Some(DatasetType::Natureza)
        );
        assert_eq!(
            DatasetType::classify("F.K03200$Z.D40511.QUALSCSV"),
            Some(DatasetType::Qualificacao)
        );
        assert_eq!(
            DatasetType::classify("f.k03200$z.d40511.paiscsv"),
            Some(DatasetType::Pais)
        );
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(DatasetType::classify("LAYOUT_DADOS_ABERTOS_CNPJ.pdf"), None);
        assert_eq!(DatasetType::classify(""), None);
    }

    #[test]
    fn test_dependency_order_is_tiered() {
        let tiers: Vec<u8> = DatasetType::DEPENDENCY_ORDER.iter().map(|d| d.tier()).collect();
        let mut sorted = tiers.clone();
        sorted.sort();
        assert_eq!(tiers, sorted);
        assert!(DatasetType::DEPENDENCY_ORDER[..6].iter().all(|d| d.is_lookup()));
    }

    #[test]
    fn test_column_layouts() {
        assert_eq!(DatasetType::Estabelecimento.columns().len(), 30);
        assert_eq!(DatasetType::Estabelecimento.load_columns().len(), 31);
        assert_eq!(
            DatasetType::Estabelecimento.load_columns().last(),
            Some(&COMPOSITE_COLUMN)
        );
        assert_eq!(DatasetType::Empresa.columns().len(), 7);
        assert_eq!(DatasetType::Socio.columns().len(), 11);
        assert_eq!(DatasetType::Simples.columns().len(), 7);
        assert_eq!(DatasetType::Pais.columns(), &["codigo", "descricao"]);
        assert_eq!(DatasetType::Pais.load_columns(), DatasetType::Pais.columns());
    }

    #[test]
    fn test_estabelecimento_load_columns_extend_source_columns() {
        let source = DatasetType::Estabelecimento.columns();
        let load = DatasetType::Estabelecimento.load_columns();
        assert_eq!(&load[..source.len()], source);
    }

    #[test]
    fn test_plan_orders_by_dependency() {
        let plan = LoadGroup::plan(&[LoadGroup::Simples, LoadGroup::Auxiliares]);
        assert_eq!(plan.len(), 7);
        assert_eq!(plan.last(), Some(&DatasetType::Simples));
        assert!(plan[..6].iter().all(|d| d.is_lookup()));

        assert_eq!(LoadGroup::plan(&[LoadGroup::All]).len(), 10);
        assert_eq!(LoadGroup::plan(&[]).len(), 10);
    }

    #[test]
    fn test_parse_group_and_dataset() {
        assert_eq!("Empresas".parse::<LoadGroup>().unwrap(), LoadGroup::Empresas);
        assert!("tudo".parse::<LoadGroup>().is_err());
        assert_eq!("paises".parse::<DatasetType>().unwrap(), DatasetType::Pais);
        assert_eq!("socio".parse::<DatasetType>().unwrap(), DatasetType::Socio);
    }
}
