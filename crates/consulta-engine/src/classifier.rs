use serde::{Deserialize, Serialize};

/// Legal domain a query is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegalArea {
    Laboral,
    Familia,
    Penal,
    Arrendamientos,
    Consumo,
    Mercantil,
    Fiscal,
    Administrativo,
    Civil,
}

impl std::fmt::Display for LegalArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Laboral => "laboral",
            Self::Familia => "familia",
            Self::Penal => "penal",
            Self::Arrendamientos => "arrendamientos",
            Self::Consumo => "consumo",
            Self::Mercantil => "mercantil",
            Self::Fiscal => "fiscal",
            Self::Administrativo => "administrativo",
            Self::Civil => "civil",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for LegalArea {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "laboral" => Ok(Self::Laboral),
            "familia" => Ok(Self::Familia),
            "penal" => Ok(Self::Penal),
            "arrendamientos" => Ok(Self::Arrendamientos),
            "consumo" => Ok(Self::Consumo),
            "mercantil" => Ok(Self::Mercantil),
            "fiscal" => Ok(Self::Fiscal),
            "administrativo" => Ok(Self::Administrativo),
            "civil" => Ok(Self::Civil),
            other => Err(format!("unknown legal area: {other}")),
        }
    }
}

/// Maps free text to a legal area and supplies prompt context for it.
pub trait AreaClassifier: Send + Sync {
    fn classify(&self, query: &str) -> Option<LegalArea>;
    fn context_for(&self, area: LegalArea) -> String;
}

struct AreaEntry {
    area: LegalArea,
    keywords: &'static [&'static str],
    description: &'static str,
    principal: &'static str,
    complementary: &'static [&'static str],
}

// Order matters: the first area with a matching keyword wins.
const AREAS: &[AreaEntry] = &[
    AreaEntry {
        area: LegalArea::Laboral,
        keywords: &[
            "despido", "despedi", "empleado", "trabajador", "nómina", "nomina", "salario",
            "finiquito", "contrato de trabajo", "convenio colectivo", "vacaciones",
            "horas extra", "baja médica", "baja medica", "prestación por desempleo",
        ],
        description: "Relaciones entre empresa y trabajador: contratación, despido, salario, jornada y prestaciones.",
        principal: "Estatuto de los Trabajadores (Real Decreto Legislativo 2/2015)",
        complementary: &[
            "Ley 36/2011, reguladora de la jurisdicción social",
            "Ley 31/1995, de Prevención de Riesgos Laborales",
            "Ley General de la Seguridad Social (Real Decreto Legislativo 8/2015)",
        ],
    },
    AreaEntry {
        area: LegalArea::Familia,
        keywords: &[
            "divorcio", "divorciar", "custodia", "pensión alimenticia", "pension alimenticia",
            "régimen de visitas", "regimen de visitas", "separación", "separacion",
            "matrimonio", "pareja de hecho", "adopción", "adopcion",
        ],
        description: "Matrimonio, separación, divorcio, filiación, custodia y alimentos.",
        principal: "Código Civil, Libro I",
        complementary: &[
            "Ley 1/2000, de Enjuiciamiento Civil (procesos de familia)",
            "Ley 15/2015, de la Jurisdicción Voluntaria",
        ],
    },
    AreaEntry {
        area: LegalArea::Penal,
        keywords: &[
            "delito", "denuncia", "robo", "hurto", "estafa", "agresión", "agresion",
            "condena", "detenido", "antecedentes penales", "violencia de género",
            "violencia de genero", "juicio rápido",
        ],
        description: "Delitos, penas, denuncias y procedimiento penal.",
        principal: "Código Penal (Ley Orgánica 10/1995)",
        complementary: &[
            "Ley de Enjuiciamiento Criminal",
            "Ley Orgánica 1/2004, de Medidas de Protección Integral contra la Violencia de Género",
        ],
    },
    AreaEntry {
        area: LegalArea::Arrendamientos,
        keywords: &[
            "alquiler", "arrendamiento", "inquilino", "arrendador", "casero", "fianza",
            "desahucio", "comunidad de propietarios",
        ],
        description: "Alquiler de vivienda y local, fianzas, desahucios y propiedad horizontal.",
        principal: "Ley 29/1994, de Arrendamientos Urbanos",
        complementary: &[
            "Ley 49/1960, de Propiedad Horizontal",
            "Ley 12/2023, por el derecho a la vivienda",
        ],
    },
    AreaEntry {
        area: LegalArea::Consumo,
        keywords: &[
            "consumidor", "garantía", "garantia", "devolución", "devolucion",
            "cláusula suelo", "clausula suelo", "compra online", "vuelo cancelado",
            "hoja de reclamaciones",
        ],
        description: "Derechos de consumidores y usuarios frente a empresas y entidades financieras.",
        principal: "Texto Refundido de la Ley General para la Defensa de los Consumidores y Usuarios (Real Decreto Legislativo 1/2007)",
        complementary: &[
            "Ley 7/1998, sobre Condiciones Generales de la Contratación",
            "Reglamento (CE) 261/2004, sobre derechos de los pasajeros aéreos",
        ],
    },
    AreaEntry {
        area: LegalArea::Mercantil,
        keywords: &[
            "sociedad limitada", "sociedad anónima", "socio", "administrador",
            "concurso de acreedores", "quiebra", "marca registrada", "estatutos sociales",
        ],
        description: "Sociedades, socios y administradores, insolvencia y propiedad industrial.",
        principal: "Ley de Sociedades de Capital (Real Decreto Legislativo 1/2010)",
        complementary: &[
            "Código de Comercio",
            "Texto Refundido de la Ley Concursal (Real Decreto Legislativo 1/2020)",
        ],
    },
    AreaEntry {
        area: LegalArea::Fiscal,
        keywords: &[
            "hacienda", "impuesto", "irpf", "declaración de la renta", "declaracion de la renta",
            "agencia tributaria", "tributar", "autónomo", "autonomo",
        ],
        description: "Impuestos, obligaciones tributarias y procedimientos ante la Agencia Tributaria.",
        principal: "Ley 58/2003, General Tributaria",
        complementary: &[
            "Ley 35/2006, del Impuesto sobre la Renta de las Personas Físicas",
            "Ley 37/1992, del Impuesto sobre el Valor Añadido",
        ],
    },
    AreaEntry {
        area: LegalArea::Administrativo,
        keywords: &[
            "multa", "sanción administrativa", "ayuntamiento", "licencia de obra",
            "recurso de alzada", "funcionario", "oposiciones", "subvención",
            "permiso de residencia", "nacionalidad", "extranjería", "extranjeria",
        ],
        description: "Relaciones con las Administraciones públicas: sanciones, recursos, licencias y extranjería.",
        principal: "Ley 39/2015, del Procedimiento Administrativo Común de las Administraciones Públicas",
        complementary: &[
            "Ley 40/2015, de Régimen Jurídico del Sector Público",
            "Ley 29/1998, reguladora de la Jurisdicción Contencioso-administrativa",
            "Ley Orgánica 4/2000, sobre derechos y libertades de los extranjeros",
        ],
    },
    AreaEntry {
        area: LegalArea::Civil,
        keywords: &[
            "herencia", "testamento", "contrato", "deuda", "indemnización", "indemnizacion",
            "vecino", "compraventa", "demanda", "reclamar una cantidad",
        ],
        description: "Obligaciones y contratos, responsabilidad civil, propiedad y sucesiones.",
        principal: "Código Civil",
        complementary: &["Ley 1/2000, de Enjuiciamiento Civil"],
    },
];

/// First-match keyword classifier over a fixed, ordered area table.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    fn entry(area: LegalArea) -> Option<&'static AreaEntry> {
        AREAS.iter().find(|e| e.area == area)
    }
}

impl AreaClassifier for KeywordClassifier {
    fn classify(&self, query: &str) -> Option<LegalArea> {
        let lowered = query.to_lowercase();
        AREAS
            .iter()
            .find(|entry| entry.keywords.iter().any(|kw| lowered.contains(kw)))
            .map(|entry| entry.area)
    }

    fn context_for(&self, area: LegalArea) -> String {
        let Some(entry) = Self::entry(area) else {
            return String::new();
        };
        let mut out = format!(
            "Área jurídica: {area}\n{}\nNormativa principal: {}\n",
            entry.description, entry.principal
        );
        if !entry.complementary.is_empty() {
            out.push_str("Normativa complementaria:\n");
            for statute in entry.complementary {
                out.push_str("- ");
                out.push_str(statute);
                out.push('\n');
            }
        }
        out
    }
}
